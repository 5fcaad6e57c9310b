//! The storage client coordinator:
//! stores SOP instances across a server pool
//! with circuit breaking, retries and failover.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use dicomnet_dimse::identifier::Transcoder;
use dicomnet_dimse::scu::{ServiceUser, StoreRequest};
use dicomnet_dimse::Priority;
use dicomnet_ul::association::client::ClientAssociationOptions;

use crate::bandwidth::ScheduledLimiter;
use crate::error::{Error, TimeoutKind};
use crate::filemeta::{self, FileMeta};
use crate::pool::{ServerEntry, ServerId, ServerPool};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Connection and negotiation parameters
/// shared by every store attempt.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub calling_ae_title: String,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// total time budget for one store attempt
    pub operation_timeout: Option<Duration>,
    pub association_timeout: Duration,
    pub max_pdu_length: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            calling_ae_title: "DICOMNET-SCU".to_string(),
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: Some(Duration::from_secs(30)),
            write_timeout: Some(Duration::from_secs(30)),
            operation_timeout: None,
            association_timeout: Duration::from_secs(30),
            max_pdu_length: dicomnet_ul::pdu::DEFAULT_MAX_PDU,
        }
    }
}

/// The report of a completed store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReport {
    /// the server that accepted the instance
    pub server: ServerId,
    pub called_ae_title: String,
    /// the final DIMSE status (success or non-fatal warning)
    pub status: u16,
    /// retries performed against the successful server
    pub retries: u32,
    pub elapsed: Duration,
    /// whether earlier candidates were skipped or failed
    pub used_failover: bool,
}

/// Stores SOP instances through a [`ServerPool`],
/// one association per attempt.
pub struct StorageClient {
    pool: Arc<ServerPool>,
    options: ClientOptions,
    retry_policy: RetryPolicy,
    retry_overrides: HashMap<String, RetryPolicy>,
    limiter: Option<Arc<ScheduledLimiter>>,
    transcoder: Option<Arc<dyn Transcoder + Send + Sync>>,
}

impl StorageClient {
    pub fn new(pool: Arc<ServerPool>, options: ClientOptions) -> Self {
        StorageClient {
            pool,
            options,
            retry_policy: RetryPolicy::default(),
            retry_overrides: HashMap::new(),
            limiter: None,
            transcoder: None,
        }
    }

    /// Replace the default retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Override the retry policy for one SOP class.
    pub fn retry_override(mut self, sop_class_uid: impl Into<String>, policy: RetryPolicy) -> Self {
        self.retry_overrides.insert(sop_class_uid.into(), policy);
        self
    }

    /// Shape outbound traffic through the given limiter.
    pub fn bandwidth_limiter(mut self, limiter: Arc<ScheduledLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Provide a transcoder collaborator;
    /// fallback transfer syntaxes are only proposed when one is set.
    pub fn transcoder(mut self, transcoder: Arc<dyn Transcoder + Send + Sync>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    fn policy_for(&self, sop_class_uid: &str) -> RetryPolicy {
        self.retry_overrides
            .get(sop_class_uid)
            .cloned()
            .unwrap_or_else(|| self.retry_policy.clone())
    }

    /// Store one instance, failing over across the pool.
    ///
    /// Servers whose circuit breaker is open are skipped
    /// without opening a transport.
    /// Each candidate is attempted under the retry policy
    /// of the instance's SOP class;
    /// when retries are exhausted with a retryable error,
    /// the next candidate takes over.
    pub async fn store(&self, data: Vec<u8>) -> Result<StoreReport, Error> {
        let meta = filemeta::parse_file_meta(&data).map_err(|e| Error::DecodingFailed {
            message: e.to_string(),
        })?;
        let data = Arc::new(data);
        let started = Instant::now();

        let mut attempted: HashSet<ServerId> = HashSet::new();
        let mut skipped_or_failed = 0usize;

        loop {
            let Some((server, breaker)) = self.pool.select(&attempted) else {
                warn!(
                    attempted = attempted.len(),
                    sop_instance_uid = %meta.media_storage_sop_instance_uid,
                    "no candidate servers remain"
                );
                return Err(Error::AllServersFailed {
                    attempted: attempted.len(),
                });
            };
            attempted.insert(server.id);

            if let Err(retry_after) = breaker.try_acquire() {
                debug!(
                    server = server.id,
                    ?retry_after,
                    "skipping server with open circuit breaker"
                );
                skipped_or_failed += 1;
                continue;
            }

            if let Some(limiter) = &self.limiter {
                let waited = limiter.acquire(data.len() as u64).await;
                if waited > Duration::ZERO {
                    debug!(?waited, "store delayed by bandwidth shaping");
                }
            }

            let executor = RetryExecutor::new(self.policy_for(&meta.media_storage_sop_class_uid));
            let outcome = executor
                .run(|context| {
                    let server = server.clone();
                    let options = self.options.clone();
                    let meta = meta.clone();
                    let data = Arc::clone(&data);
                    let transcoder = self.transcoder.clone();
                    async move {
                        debug!(
                            server = server.id,
                            attempt = context.attempt,
                            "performing store attempt"
                        );
                        attempt_store(server, options, meta, data, transcoder).await
                    }
                })
                .await;

            match outcome.result {
                Ok(status) => {
                    breaker.record_success();
                    let report = StoreReport {
                        server: server.id,
                        called_ae_title: server.called_ae_title.clone(),
                        status,
                        retries: outcome.retries(),
                        elapsed: started.elapsed(),
                        used_failover: skipped_or_failed > 0,
                    };
                    info!(
                        server = server.id,
                        status = format_args!("0x{:04X}", status),
                        retries = report.retries,
                        used_failover = report.used_failover,
                        sop_instance_uid = %meta.media_storage_sop_instance_uid,
                        "store complete"
                    );
                    return Ok(report);
                }
                Err(error) => {
                    breaker.record_failure();
                    if error.retryable() {
                        warn!(
                            server = server.id,
                            error = %error,
                            "store attempts exhausted, failing over"
                        );
                        skipped_or_failed += 1;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }
}

/// One store attempt:
/// the blocking association work runs on the blocking pool,
/// bounded by the per-server or global operation timeout.
async fn attempt_store(
    server: ServerEntry,
    options: ClientOptions,
    meta: FileMeta,
    data: Arc<Vec<u8>>,
    transcoder: Option<Arc<dyn Transcoder + Send + Sync>>,
) -> Result<u16, Error> {
    let budget = server.timeout.or(options.operation_timeout);
    let work =
        tokio::task::spawn_blocking(move || perform_store(server, options, meta, &data, transcoder));

    let joined = match budget {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(Error::Timeout {
                    kind: TimeoutKind::Operation,
                })
            }
        },
        None => work.await,
    };

    match joined {
        Ok(result) => result,
        Err(join_error) => Err(Error::InvalidState {
            message: format!("store task failed: {}", join_error),
        }),
    }
}

/// Open an association to the server,
/// negotiate a presentation context for the instance's SOP class,
/// perform the C-STORE and release.
fn perform_store(
    server: ServerEntry,
    options: ClientOptions,
    meta: FileMeta,
    data: &[u8],
    transcoder: Option<Arc<dyn Transcoder + Send + Sync>>,
) -> Result<u16, Error> {
    // the instance's own transfer syntax leads;
    // fallbacks only make sense with a transcoder at hand
    let mut transfer_syntaxes = vec![meta.transfer_syntax_uid.clone()];
    if let Some(transcoder) = &transcoder {
        for uid in transcoder.fallback_transfer_syntaxes(&meta.transfer_syntax_uid) {
            if !transfer_syntaxes.contains(&uid) {
                transfer_syntaxes.push(uid);
            }
        }
    }

    let mut builder = ClientAssociationOptions::new()
        .calling_ae_title(options.calling_ae_title)
        .called_ae_title(server.called_ae_title)
        .with_presentation_context(meta.media_storage_sop_class_uid.clone(), transfer_syntaxes)
        .max_pdu_length(options.max_pdu_length.min(server.max_pdu_length))
        .association_timeout(options.association_timeout);
    if let Some(timeout) = options.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(timeout) = options.read_timeout {
        builder = builder.read_timeout(timeout);
    }
    if let Some(timeout) = options.write_timeout {
        builder = builder.write_timeout(timeout);
    }
    if let Some(identity) = server.user_identity {
        builder = builder.user_identity(identity);
    }

    let association = builder.establish((server.host.as_str(), server.port))?;
    let mut scu = ServiceUser::new(association);

    let negotiated_transfer_syntax = scu
        .association()
        .accepted_presentation_contexts()
        .find(|pc| pc.abstract_syntax == meta.media_storage_sop_class_uid)
        .map(|pc| pc.transfer_syntax.clone())
        .ok_or_else(|| Error::SopClassNotSupported {
            uid: meta.media_storage_sop_class_uid.clone(),
        })?;

    let payload: std::borrow::Cow<'_, [u8]> =
        if negotiated_transfer_syntax == meta.transfer_syntax_uid {
            data.into()
        } else {
            let transcoder = transcoder.as_ref().ok_or_else(|| Error::EncodingFailed {
                message: format!(
                    "peer requires transfer syntax {} but no transcoder is available",
                    negotiated_transfer_syntax
                ),
            })?;
            transcoder
                .transcode(data, &meta.transfer_syntax_uid, &negotiated_transfer_syntax)
                .map_err(|e| Error::EncodingFailed {
                    message: e.to_string(),
                })?
                .into()
        };

    let outcome = scu.store(StoreRequest {
        sop_class_uid: &meta.media_storage_sop_class_uid,
        sop_instance_uid: &meta.media_storage_sop_instance_uid,
        data: payload.as_ref(),
        priority: Priority::Medium,
        move_originator: None,
    })?;

    // a failure status completes the operation without aborting,
    // so the association still winds down gracefully
    let status = outcome.status;
    let success = outcome.is_success();
    if let Err(e) = scu.release() {
        debug!(error = %e, "release after store failed");
    }

    if success {
        Ok(status)
    } else {
        Err(Error::StoreFailed { status })
    }
}
