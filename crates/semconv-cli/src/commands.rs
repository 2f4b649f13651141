use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use console::style;
use semconv_migrate::{
    Engine, EngineConfig, JobState, MigrationError, ResolverMode, SavedQueryMode, TracingSink,
};
use semconv_store::{
    MemoryStore, Query, RecordFilter, RecordId, RecordStore, SavedQuery, SavedQueryStore, SchemaVersion,
    SqliteStore, TimeRange,
};
use serde_json::json;

use crate::json::{parse_predicate, record_from_json, record_to_json};

type Result = std::result::Result<(), Box<dyn std::error::Error>>;

const INGEST_BATCH: usize = 500;

fn engine(config: &EngineConfig, store: Arc<SqliteStore>) -> std::result::Result<Engine, Box<dyn std::error::Error>> {
    Ok(Engine::builder(config.clone())
        .store(store)
        .audit_sink(Arc::new(TracingSink))
        .build()?)
}

fn open(db_path: &str) -> std::result::Result<Arc<SqliteStore>, Box<dyn std::error::Error>> {
    Ok(Arc::new(SqliteStore::open(db_path)?))
}

fn query_from(version: &SchemaVersion, predicates: &[String]) -> std::result::Result<Query, String> {
    predicates
        .iter()
        .try_fold(Query::new(version.clone()), |q, expr| Ok(q.with(parse_predicate(expr)?)))
}

/// `semconv status <db>`: record counts per schema version.
pub async fn status(config: &EngineConfig, db_path: &str) -> Result {
    let store = open(db_path)?;
    let engine = engine(config, Arc::clone(&store))?;
    let size = store.file_size().await?;
    let journal = store.journal_mode().await?;
    let counts = engine.version_counts().await?;
    let saved = store.list_saved_queries().await?;

    println!("Database: {db_path} (SQLite, {journal} mode)");
    println!("Size: {}", format_bytes(size));
    println!(
        "Current version: {}",
        style(engine.versions().default_version()).bold()
    );
    println!();

    if counts.is_empty() {
        println!("  (empty database)");
        return Ok(());
    }

    println!("  {:<12} {:>12} {:>10}", "Version", "Records", "");
    println!("  {}", "-".repeat(36));
    let mut total = 0;
    for count in &counts {
        total += count.records;
        let marker = if &count.version == engine.versions().default_version() {
            style("current").green().to_string()
        } else if engine.versions().contains(&count.version) {
            style("pending").yellow().to_string()
        } else {
            style("unsupported").red().to_string()
        };
        println!(
            "  {:<12} {:>12} {:>10}",
            count.version.as_str(),
            format_num(count.records),
            marker
        );
    }
    println!("  {}", "-".repeat(36));
    println!("  {:<12} {:>12}", "Total", format_num(total));
    println!();
    println!("Saved queries: {}", saved.len());

    Ok(())
}

/// `semconv ingest <db> <file>`: load JSON-lines records.
pub async fn ingest(config: &EngineConfig, db_path: &str, file: &str, version: Option<&str>) -> Result {
    let engine = engine(config, open(db_path)?)?;
    let fallback = version.map(SchemaVersion::new);
    let reader: Box<dyn BufRead> = if file == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        Box::new(BufReader::new(std::fs::File::open(file)?))
    };

    let mut batch = Vec::with_capacity(INGEST_BATCH);
    let mut total = 0;
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = record_from_json(&line, fallback.as_ref())
            .map_err(|e| format!("{file}:{}: {e}", n + 1))?;
        batch.push(record);
        if batch.len() == INGEST_BATCH {
            total += engine.ingest_batch(std::mem::take(&mut batch)).await?;
            tracing::debug!(total, "ingest batch stored");
        }
    }
    if !batch.is_empty() {
        total += engine.ingest_batch(batch).await?;
    }

    println!("Ingested {} records into {db_path}", format_num(total as u64));
    Ok(())
}

/// `semconv mapping <from> <to>`: print the rename table for a pair.
pub async fn mapping(config: &EngineConfig, from: &str, to: &str) -> Result {
    let engine = Engine::builder(config.clone())
        .memory_store(Arc::new(MemoryStore::new()))
        .build()?;
    let mapping = engine.get_mapping(&from.into(), &to.into()).await?;
    let renames: serde_json::Map<String, serde_json::Value> = mapping
        .renames()
        .map(|(old, new)| (old.to_string(), json!(new)))
        .collect();
    let output = json!({
        "from": from,
        "to": to,
        "revision": mapping.revision(),
        "fetched_at": mapping.fetched_at().to_rfc3339(),
        "renames": renames,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// `semconv migrate <db> <from> <to>`: run a migration job to completion.
/// Ctrl-C cancels the job.
pub async fn migrate(
    config: &EngineConfig,
    db_path: &str,
    from: &str,
    to: &str,
    since: Option<u64>,
    until: Option<u64>,
) -> Result {
    let engine = engine(config, open(db_path)?)?;
    let mut filter = RecordFilter::all();
    if since.is_some() || until.is_some() {
        filter = filter.with_time_range(TimeRange {
            start: since,
            end: until,
        });
    }

    let handle = engine.start_migration(&from.into(), &to.into(), filter).await?;
    eprintln!("Migrating {from} → {to} (job {})", handle.id());

    let wait = engine.wait_for_job(handle);
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut cancelled = false;
    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                eprintln!("{}", style("cancelling, waiting for in-flight pages...").yellow());
                engine.cancel_migration(handle)?;
                cancelled = true;
            }
            _ = ticker.tick() => {
                let status = engine.job_status(handle)?;
                if status.state == JobState::Running {
                    eprint!(
                        "\r  scanned {:>10}  migrated {:>10}  skipped {:>8}  failed {:>6}",
                        format_num(status.progress.scanned),
                        format_num(status.progress.migrated),
                        format_num(status.progress.skipped),
                        format_num(status.progress.failed),
                    );
                    std::io::stderr().flush()?;
                }
            }
        }
    };
    eprintln!();

    match outcome {
        Ok(report) => {
            println!(
                "{} in {:.1}s",
                style("Migration completed").green().bold(),
                report.elapsed.as_secs_f64()
            );
            print_progress(&report.progress);
            Ok(())
        }
        Err(MigrationError::Abort(abort)) => {
            println!("{}: {}", style("Migration failed").red().bold(), abort.reason);
            print_progress(&abort.progress);
            Err(MigrationError::Abort(abort).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_progress(progress: &semconv_migrate::Progress) {
    println!("  scanned:  {}", format_num(progress.scanned));
    println!("  migrated: {}", format_num(progress.migrated));
    println!("  skipped:  {}", format_num(progress.skipped));
    println!("  failed:   {}", format_num(progress.failed));
}

/// `semconv resolve <db> <target> --where ...`: run a query across old and
/// new attribute locations.
pub async fn resolve(config: &EngineConfig, db_path: &str, target: &str, predicates: &[String], both: bool) -> Result {
    let engine = engine(config, open(db_path)?)?;
    let target = SchemaVersion::new(target);
    let query = query_from(&target, predicates)?;
    let mode = if both {
        ResolverMode::BothPhases
    } else {
        engine.resolver().mode()
    };

    let resolution = engine.resolve_query_with(&query, &target, mode).await?;
    let records: Vec<_> = resolution
        .records
        .iter()
        .map(|r| json!({ "source": r.source, "record": record_to_json(&r.record) }))
        .collect();
    let output = json!({
        "source": resolution.source,
        "count": records.len(),
        "records": records,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// `semconv save-query <db> <id> <name> --version <v> --where ...`
pub async fn save_query(db_path: &str, id: &str, name: &str, version: &str, predicates: &[String]) -> Result {
    let store = open(db_path)?;
    let query = query_from(&version.into(), predicates)?;
    store.save_query(SavedQuery::new(id, name, query)).await?;
    println!("Saved query {id} ({name}) at version {version}");
    Ok(())
}

/// `semconv update-queries <db> <to>`: rewrite saved queries to a version.
pub async fn update_queries(config: &EngineConfig, db_path: &str, to: &str, both_locations: bool) -> Result {
    let engine = engine(config, open(db_path)?)?;
    let updated = if both_locations {
        engine
            .update_saved_queries_with(&to.into(), SavedQueryMode::BothLocations)
            .await?
    } else {
        engine.update_saved_queries(&to.into()).await?
    };
    println!("Updated {updated} saved queries to {to}");
    Ok(())
}

/// `semconv export <db>`: dump records as JSON lines.
pub async fn export(db_path: &str, version: Option<&str>, out: Option<&Path>) -> Result {
    let store = open(db_path)?;
    let mut filter = RecordFilter::all();
    if let Some(v) = version {
        filter = filter.with_versions([SchemaVersion::new(v)]);
    }

    let mut writer: Box<dyn Write> = match out {
        Some(path) => Box::new(std::io::BufWriter::new(std::fs::File::create(path)?)),
        None => Box::new(std::io::BufWriter::new(std::io::stdout().lock())),
    };

    let mut after: Option<RecordId> = None;
    let mut total = 0u64;
    loop {
        let page = store.scan(&filter, after.as_ref(), 1_000).await?;
        if page.is_empty() {
            break;
        }
        for record in &page {
            serde_json::to_writer(&mut writer, &record_to_json(record))?;
            writeln!(writer)?;
        }
        total += page.len() as u64;
        after = page.last().map(|r| r.id.clone());
    }
    writer.flush()?;
    eprintln!("Exported {} records", format_num(total));
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn format_num(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, ch) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(ch);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_get_thousands_separators() {
        assert_eq!(format_num(7), "7");
        assert_eq!(format_num(1_000), "1,000");
        assert_eq!(format_num(1_234_567), "1,234,567");
        assert_eq!(format_bytes(2_048), "2.0 KB");
    }

    #[test]
    fn where_clauses_build_a_query() {
        let query = query_from(
            &"1.32".into(),
            &["attributes.trade.type=arbitrage".to_string(), "attributes.amount>10".to_string()],
        )
        .unwrap();
        assert_eq!(query.predicates.len(), 2);
        assert_eq!(query.version.as_str(), "1.32");
        assert!(query_from(&"1.32".into(), &["bad".to_string()]).is_err());
    }
}
