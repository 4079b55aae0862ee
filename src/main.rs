// 🔬 Ledger Forensics CLI - Ingest, Review, Learn
// Modes: ingest <files..>, report <doc_id>, review, approve/reject/reanalyze,
// learning, sync, metrics. The API server lives in bin/server.rs.

use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use ledger_forensics::pipeline::ForensicPipeline;
use ledger_forensics::{DocumentStatus, PipelineConfig, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledger_forensics=info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("help");

    let config = PipelineConfig::from_env();
    let pipeline = Arc::new(ForensicPipeline::new(config)?);

    match mode {
        "ingest" => run_ingest(&pipeline, &args[2..]).await,
        "report" => run_report(&pipeline, args.get(2)),
        "review" => run_review(&pipeline),
        "approve" => run_decision(&pipeline, &args[2..], true),
        "reject" => run_decision(&pipeline, &args[2..], false),
        "reanalyze" => run_reanalyze(&pipeline, args.get(2)).await,
        "learning" => run_learning(&pipeline),
        "sync" => run_sync(&pipeline).await,
        "metrics" => run_metrics(&pipeline),
        _ => {
            print_help();
            Ok(())
        }
    }
}

fn print_help() {
    println!("🔬 Ledger Forensics v{}", VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  ingest <file> [file..] [--batch <id>]  process documents");
    println!("  report <doc_id>                        full document report");
    println!("  review                                 documents awaiting review");
    println!("  approve <doc_id> <reviewer>            approve a document");
    println!("  reject <doc_id> <reviewer>             reject a document");
    println!("  reanalyze <doc_id>                     re-run the pipeline");
    println!("  learning                               correction/learning status");
    println!("  sync                                   push learned rules to memory");
    println!("  metrics                                pipeline-wide metrics");
}

async fn run_ingest(pipeline: &Arc<ForensicPipeline>, args: &[String]) -> Result<()> {
    let mut files: Vec<&String> = Vec::new();
    let mut batch_id: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--batch" {
            batch_id = iter.next().cloned();
        } else {
            files.push(arg);
        }
    }
    if files.is_empty() {
        return Err(anyhow!("usage: ingest <file> [file..] [--batch <id>]"));
    }

    println!("📥 Ingesting {} document(s)", files.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // One task per document; unrelated files process in parallel and the
    // per-file summary comes back in argument order
    let mut handles = Vec::with_capacity(files.len());
    for path in &files {
        let bytes = fs::read(path)?;
        let filename = Path::new(path.as_str())
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path.as_str())
            .to_string();
        let pipeline = Arc::clone(pipeline);
        let batch_id = batch_id.clone();
        let handle = tokio::spawn(async move {
            let doc = pipeline
                .submit_document(&bytes, &filename, batch_id.as_deref())
                .await?;
            Ok::<_, anyhow::Error>((filename, doc))
        });
        handles.push(handle);
    }

    let mut settled = 0;
    let mut flagged = 0;
    let mut failed = 0;
    let total = handles.len();
    for (i, handle) in handles.into_iter().enumerate() {
        let (filename, doc) = handle.await??;
        println!("\n📄 [{}/{}] {}", i + 1, total, filename);
        match doc.status {
            DocumentStatus::Validated => {
                settled += 1;
                println!("✓ VALIDATED  confidence {:.2}  id {}", doc.confidence, doc.id);
            }
            DocumentStatus::Review => {
                flagged += 1;
                println!("⚠️  REVIEW     confidence {:.2}  id {}", doc.confidence, doc.id);
                if let Some(reason) = &doc.status_reason {
                    println!("   reason: {}", reason);
                }
            }
            _ => {
                failed += 1;
                println!("❌ FAILED     id {}", doc.id);
                if let Some(reason) = &doc.status_reason {
                    println!("   reason: {}", reason);
                }
            }
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "🎯 Done: {} validated, {} to review, {} failed",
        settled, flagged, failed
    );

    // Corrections accumulated elsewhere may have armed a learning cycle
    if let Some(event) = pipeline.maybe_trigger_learning()? {
        println!("🧠 Learning cycle fired: {}", event.detail);
    }
    Ok(())
}

fn run_report(pipeline: &ForensicPipeline, doc_id: Option<&String>) -> Result<()> {
    let doc_id = doc_id.ok_or_else(|| anyhow!("usage: report <doc_id>"))?;
    let view = pipeline
        .document_view(doc_id)?
        .ok_or_else(|| anyhow!("document {} not found", doc_id))?;
    let doc = &view.document;

    println!("📄 {} ({})", doc.filename, doc.id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  status:     {}", doc.status.as_str());
    if let Some(reason) = &doc.status_reason {
        println!("  reason:     {}", reason);
    }
    println!("  type:       {}", doc.doc_type);
    println!("  confidence: {:.2}", doc.confidence);
    if !doc.currency.is_empty() {
        println!("  currency:   {}", doc.currency);
    }
    if let Some(q) = doc.quality_score {
        println!("  quality:    {:.2}", q);
    }

    println!("\n💾 {} transaction(s)", view.transactions.len());
    for tx in view.transactions.iter().take(20) {
        let flag = if tx.is_anomaly { "⚠️ " } else { "  " };
        println!(
            "  {}{}  {:>12.2}  {}",
            flag, tx.date, tx.amount, tx.description
        );
    }
    if view.transactions.len() > 20 {
        println!("  … {} more", view.transactions.len() - 20);
    }

    println!("\n🔍 {} anomaly(ies)", view.anomalies.len());
    for stored in &view.anomalies {
        let mark = if stored.resolved { "✓" } else { "•" };
        println!(
            "  {} [{}] {}: {}",
            mark,
            stored.anomaly.severity.as_str(),
            stored.anomaly.check,
            stored.anomaly.description
        );
    }

    if !view.entities.is_empty() {
        println!("\n🕸️  {} entity(ies)", view.entities.len());
        for link in &view.entities {
            println!(
                "  {} ({}) as {}, seen {} time(s)",
                link.canonical_name, link.category, link.relationship, link.mention_count
            );
        }
    }

    if !view.corrections.is_empty() {
        println!("\n✏️  {} correction(s)", view.corrections.len());
        for c in &view.corrections {
            println!(
                "  {}: '{}' → '{}' by {}",
                c.field_name, c.original_value, c.corrected_value, c.corrected_by
            );
        }
    }
    Ok(())
}

fn run_review(pipeline: &ForensicPipeline) -> Result<()> {
    let queue = pipeline.review_queue(50)?;
    println!("⚠️  {} document(s) awaiting review", queue.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for doc in &queue {
        println!(
            "  {}  {:.2}  {}  {}",
            doc.id,
            doc.confidence,
            doc.filename,
            doc.status_reason.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn run_decision(pipeline: &ForensicPipeline, args: &[String], approve: bool) -> Result<()> {
    let (doc_id, actor) = match (args.first(), args.get(1)) {
        (Some(d), Some(a)) => (d, a.as_str()),
        _ => return Err(anyhow!("usage: approve|reject <doc_id> <reviewer>")),
    };
    let doc = if approve {
        pipeline.approve(doc_id, actor)?
    } else {
        pipeline.reject(doc_id, actor)?
    };
    println!("✓ {} is now {}", doc.id, doc.status.as_str());
    Ok(())
}

async fn run_reanalyze(pipeline: &ForensicPipeline, doc_id: Option<&String>) -> Result<()> {
    let doc_id = doc_id.ok_or_else(|| anyhow!("usage: reanalyze <doc_id>"))?;
    println!("🔄 Reanalyzing {}…", doc_id);
    let doc = pipeline.reanalyze(doc_id, "cli").await?;
    println!(
        "✓ {} settled as {} (confidence {:.2})",
        doc.id,
        doc.status.as_str(),
        doc.confidence
    );
    Ok(())
}

fn run_learning(pipeline: &ForensicPipeline) -> Result<()> {
    let status = pipeline.learning_status()?;
    println!("🧠 Learning status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  corrections:      {}", status.corrections_total);
    println!("  fields extracted: {}", status.fields_extracted);
    println!("  error rate:       {:.3}", status.error_rate);
    println!("  cooldown mark:    {}", status.cooldown_mark);

    println!("\n📊 {} correction cluster(s)", status.clusters.len());
    for cluster in &status.clusters {
        println!("  {} × {}", cluster.count, cluster.field_name);
    }

    println!("\n📜 {} active rule(s)", status.active_rules.len());
    for rule in &status.active_rules {
        println!("  • {}", rule);
    }

    if !status.recent_events.is_empty() {
        println!("\n🗓️  recent events");
        for event in status.recent_events.iter().take(10) {
            let mark = if event.success { "✓" } else { "✗" };
            println!("  {} {} {}", mark, event.kind.as_str(), event.detail);
        }
    }
    Ok(())
}

async fn run_sync(pipeline: &ForensicPipeline) -> Result<()> {
    println!("📡 Syncing learned rules…");
    let event = pipeline.sync().await?;
    if event.success {
        println!("✓ {}", event.detail);
    } else {
        println!("✗ {}", event.detail);
    }
    Ok(())
}

fn run_metrics(pipeline: &ForensicPipeline) -> Result<()> {
    let metrics = pipeline.metrics()?;
    println!("📊 Pipeline metrics");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  documents:       {}", metrics.documents);
    let mut statuses: Vec<_> = metrics.by_status.iter().collect();
    statuses.sort();
    for (status, count) in statuses {
        println!("    {:<10} {}", status, count);
    }
    if let Some(avg) = metrics.avg_confidence {
        println!("  avg confidence:  {:.2}", avg);
    }
    println!("  anomalies:       {} ({} open)", metrics.anomalies, metrics.open_anomalies);
    println!("  corrections:     {}", metrics.corrections);
    println!("  entities:        {}", metrics.entities);
    println!("  learning events: {}", metrics.learning_events);

    let clusters = pipeline.failure_clusters()?;
    if !clusters.is_empty() {
        println!("\n❌ failure clusters");
        for cluster in &clusters {
            println!("  {} × {}", cluster.count, cluster.reason);
        }
    }
    Ok(())
}
