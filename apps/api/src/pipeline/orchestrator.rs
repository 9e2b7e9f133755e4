//! Request driver: walks every offer of a generation request through the
//! pipeline, bounded fan-out, cancellation cleanup, progress accounting.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::cv::{CvDocument, CvFileRow};
use crate::models::generation::{GenerationOfferRow, GenerationRequestRow, OfferStatus};
use crate::models::task::CANCELLED_MARKER;
use crate::pipeline::batch::run_section_batches;
use crate::pipeline::classify::{apply_classification, execute_classification};
use crate::pipeline::extract::execute_extraction;
use crate::pipeline::recompose::execute_recomposition;
use crate::pipeline::{set_offer_status, PipelineContext};
use crate::storage::{read_cv, set_processing_status, PROCESSING_GENERATING};
use crate::tasks::ledger::TaskStore;
use crate::tasks::recovery::PROCESSING_IDLE;
use crate::tasks::scheduler::CancelSignal;
use crate::telemetry::{self, TaskEvent};

const MAX_RETRIES: u32 = 3;

/// Retries `op` up to three times after the first failure with exponential
/// backoff (1s, 2s, 4s). A tripped signal stops the loop immediately, backoff
/// included.
pub async fn with_retry<T, F, Fut>(label: &str, signal: &CancelSignal, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=MAX_RETRIES {
        if signal.is_cancelled() {
            anyhow::bail!("{label} cancelled");
        }

        if attempt > 0 {
            let delay = std::time::Duration::from_millis(1000 * (1 << (attempt - 1)));
            warn!(
                "{label} attempt {attempt} failed, retrying after {}ms",
                delay.as_millis()
            );
            let mut cancel = signal.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => anyhow::bail!("{label} cancelled"),
            }
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("{label} failed without attempts"))
        .context(format!("{label} failed after {MAX_RETRIES} retries")))
}

/// The unit of work handed to the Scheduler for one generation request.
/// Writes its own result payload; the scheduler only flips ledger status.
pub async fn run_generation_request(
    ctx: PipelineContext,
    store: Arc<dyn TaskStore>,
    task_id: String,
    owner_id: Uuid,
    request_id: Uuid,
    signal: CancelSignal,
) -> Result<()> {
    let request = load_request(&ctx.db, request_id, owner_id)
        .await?
        .with_context(|| format!("generation request {request_id} not found"))?;
    let offers = load_offers(&ctx.db, request_id).await?;

    let source_file = read_cv(&ctx.db, owner_id, request.source_cv_id)
        .await?
        .with_context(|| format!("source CV {} not found", request.source_cv_id))?;
    let source: CvDocument = source_file
        .document()
        .context("source CV content is not a sectioned document")?;

    set_request_status(&ctx.db, request_id, "running", None).await?;
    set_processing_status(&ctx.db, source_file.id, PROCESSING_GENERATING).await?;

    let source_file = Arc::new(source_file);
    let source = Arc::new(source);

    let semaphore = Arc::new(Semaphore::new(ctx.max_concurrent_offers));
    let mut join_set: JoinSet<bool> = JoinSet::new();

    for offer in offers {
        let ctx = ctx.clone();
        let signal = signal.clone();
        let semaphore = semaphore.clone();
        let source_file = source_file.clone();
        let source = source.clone();

        join_set.spawn(async move {
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return false,
            };
            if signal.is_cancelled() {
                fail_offer(&ctx.db, offer.id, CANCELLED_MARKER).await;
                increment_completed_offers(&ctx.db, offer.request_id).await;
                return false;
            }
            let success = process_offer(&ctx, &offer, &source_file, &source, &signal).await;
            increment_completed_offers(&ctx.db, offer.request_id).await;
            success
        });
    }

    let mut successes = 0u32;
    let mut failures = 0u32;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(true) => successes += 1,
            Ok(false) => failures += 1,
            Err(join_err) => {
                warn!("Offer worker panicked: {join_err}");
                failures += 1;
            }
        }
    }

    // The source is only held for the duration of the run.
    set_processing_status(&ctx.db, source_file.id, PROCESSING_IDLE).await?;

    if signal.is_cancelled() {
        fail_pending_offers(&ctx.db, request_id, CANCELLED_MARKER).await?;
        set_request_status(&ctx.db, request_id, "failed", Some(CANCELLED_MARKER)).await?;
        anyhow::bail!("generation request {request_id} cancelled");
    }

    let result = serde_json::json!({
        "request_id": request_id,
        "generated": successes,
        "failed": failures,
    });
    if let Err(e) = store.record_result(&task_id, owner_id, result).await {
        warn!("Could not record result for task {task_id}: {e:#}");
    }

    if successes == 0 {
        let error = format!("all {failures} offers failed");
        set_request_status(&ctx.db, request_id, "failed", Some(&error)).await?;
        anyhow::bail!(error);
    }

    set_request_status(&ctx.db, request_id, "completed", None).await?;
    info!("Request {request_id} completed: {successes} generated, {failures} failed");
    Ok(())
}

/// One offer, created through completed/failed. Never propagates an error;
/// the return value only feeds the request's success count.
async fn process_offer(
    ctx: &PipelineContext,
    offer: &GenerationOfferRow,
    source_file: &CvFileRow,
    source: &CvDocument,
    signal: &CancelSignal,
) -> bool {
    let started = Utc::now();
    if let Err(e) = mark_offer_started(&ctx.db, offer.id).await {
        warn!("Could not mark offer {} started: {e:#}", offer.id);
    }

    let outcome = drive_offer(ctx, offer, source_file, source, signal).await;

    match outcome {
        Ok(()) => {
            let duration_ms = (Utc::now() - started).num_milliseconds();
            if let Err(e) = complete_offer(&ctx.db, offer.id).await {
                warn!("Could not mark offer {} completed: {e:#}", offer.id);
            }
            telemetry::emit(&TaskEvent::OfferCompleted {
                offer_id: offer.id,
                request_id: offer.request_id,
                duration_ms,
            });
            true
        }
        Err(e) => {
            let error = if signal.is_cancelled() {
                CANCELLED_MARKER.to_string()
            } else {
                format!("{e:#}")
            };
            fail_offer(&ctx.db, offer.id, &error).await;
            telemetry::emit(&TaskEvent::OfferFailed {
                offer_id: offer.id,
                request_id: offer.request_id,
                error: &error,
            });
            false
        }
    }
}

async fn drive_offer(
    ctx: &PipelineContext,
    offer: &GenerationOfferRow,
    source_file: &CvFileRow,
    source: &CvDocument,
    signal: &CancelSignal,
) -> Result<()> {
    set_offer_status(&ctx.db, offer.id, OfferStatus::Extracting).await?;
    let extraction = with_retry("extraction", signal, |_| {
        execute_extraction(ctx, offer, signal)
    })
    .await?;
    set_offer_status(&ctx.db, offer.id, OfferStatus::Extracted).await?;

    let posting_json = serde_json::to_value(&extraction.posting)?;

    set_offer_status(&ctx.db, offer.id, OfferStatus::Classifying).await?;
    let classification = with_retry("classification", signal, |_| {
        execute_classification(ctx, offer, source, &posting_json, signal)
    })
    .await?;
    set_offer_status(&ctx.db, offer.id, OfferStatus::Classified).await?;

    let classified = apply_classification(source, &classification);

    set_offer_status(&ctx.db, offer.id, OfferStatus::Batching).await?;
    let outcomes =
        run_section_batches(ctx, offer.id, source, &classified, &posting_json, signal).await;
    set_offer_status(&ctx.db, offer.id, OfferStatus::Batched).await?;

    if signal.is_cancelled() {
        anyhow::bail!("offer {} cancelled", offer.id);
    }

    set_offer_status(&ctx.db, offer.id, OfferStatus::Recomposing).await?;
    execute_recomposition(
        ctx,
        offer,
        source_file,
        source,
        &classification,
        &classified,
        &outcomes,
        &extraction.posting,
        signal,
    )
    .await?;

    Ok(())
}

// ── Row access ───────────────────────────────────────────────────────────────

async fn load_request(
    db: &PgPool,
    request_id: Uuid,
    owner_id: Uuid,
) -> Result<Option<GenerationRequestRow>> {
    let row = sqlx::query_as::<_, GenerationRequestRow>(
        "SELECT * FROM generation_requests WHERE id = $1 AND owner_id = $2",
    )
    .bind(request_id)
    .bind(owner_id)
    .fetch_optional(db)
    .await?;
    Ok(row)
}

async fn load_offers(db: &PgPool, request_id: Uuid) -> Result<Vec<GenerationOfferRow>> {
    let rows = sqlx::query_as::<_, GenerationOfferRow>(
        "SELECT * FROM generation_offers WHERE request_id = $1 ORDER BY offer_index",
    )
    .bind(request_id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

async fn set_request_status(
    db: &PgPool,
    request_id: Uuid,
    status: &str,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE generation_requests
        SET status = $2, error = $3,
            completed_at = CASE WHEN $2 IN ('completed', 'failed') THEN NOW() ELSE completed_at END
        WHERE id = $1
        "#,
    )
    .bind(request_id)
    .bind(status)
    .bind(error)
    .execute(db)
    .await?;
    Ok(())
}

/// Best-effort progress counter, one bump per terminal offer.
async fn increment_completed_offers(db: &PgPool, request_id: Uuid) {
    let result = sqlx::query(
        "UPDATE generation_requests SET completed_offers = completed_offers + 1 WHERE id = $1",
    )
    .bind(request_id)
    .execute(db)
    .await;
    if let Err(e) = result {
        warn!("Could not bump offer progress for request {request_id}: {e}");
    }
}

async fn mark_offer_started(db: &PgPool, offer_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE generation_offers SET started_at = NOW() WHERE id = $1")
        .bind(offer_id)
        .execute(db)
        .await?;
    Ok(())
}

async fn complete_offer(db: &PgPool, offer_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE generation_offers SET status = 'completed', completed_at = NOW() WHERE id = $1",
    )
    .bind(offer_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Best-effort: failing an offer must never mask the error being recorded.
async fn fail_offer(db: &PgPool, offer_id: Uuid, error: &str) {
    let result = sqlx::query(
        "UPDATE generation_offers SET status = 'failed', error = $2, completed_at = NOW() WHERE id = $1",
    )
    .bind(offer_id)
    .bind(error)
    .execute(db)
    .await;
    if let Err(e) = result {
        warn!("Could not mark offer {offer_id} failed: {e}");
    }
}

/// Cancellation cleanup: every offer the fan-out never reached goes terminal
/// with the cancelled marker instead of dangling in `created`.
async fn fail_pending_offers(db: &PgPool, request_id: Uuid, error: &str) -> Result<u64> {
    let done = sqlx::query(
        r#"
        UPDATE generation_offers
        SET status = 'failed', error = $2, completed_at = NOW()
        WHERE request_id = $1 AND status NOT IN ('completed', 'failed')
        "#,
    )
    .bind(request_id)
    .bind(error)
    .execute(db)
    .await?;
    Ok(done.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::watch;

    fn never() -> CancelSignal {
        CancelSignal::never()
    }

    #[tokio::test]
    async fn test_with_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("op", &never(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_retries_three_times_with_backoff() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<u32> = with_retry("op", &never(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    anyhow::bail!("transient")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // Backoff slept 1s + 2s + 4s of virtual time.
        assert_eq!(started.elapsed().as_secs(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("op", &never(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("permanent") }
        })
        .await;

        let error = format!("{:#}", result.unwrap_err());
        assert!(error.contains("failed after 3 retries"));
        assert!(error.contains("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_tripped_signal() {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        let signal = CancelSignal::from_receiver(rx);

        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("op", &signal, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(1) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_aborts_backoff_when_cancelled() {
        let (tx, rx) = watch::channel(false);
        let signal = CancelSignal::from_receiver(rx);

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });

        let result: Result<u32> =
            with_retry("op", &signal, |_| async { anyhow::bail!("transient") }).await;

        cancel.await.unwrap();
        let error = result.unwrap_err().to_string();
        assert!(error.contains("cancelled"));
    }
}
