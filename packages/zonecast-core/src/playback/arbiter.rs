//! Playback arbitration.
//!
//! At most one of mic, schedule, playlist, file and remote media owns the
//! encoder at any time. Priority is mic > schedule > {playlist, file, remote}:
//!
//! - mic preempts everything, then waits a grace period before spawning
//! - schedule preempts the low-priority modes but is rejected while mic is live
//! - the low-priority modes are mutually exclusive (`MODE_BUSY`)
//!
//! Starts and stops are serialized through an in-flight marker. A user start
//! arriving mid-transition fails fast, a mic start waits (bounded) for it to
//! settle, and automatic restarts (playlist advance, crash retry) park in a
//! single pending slot that is re-run once the transition settles.
//!
//! Failures after the synchronous start path only surface as
//! [`PlaybackEvent`]s and through [`PlaybackArbiter::status`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{ZonecastError, ZonecastResult};
use crate::events::{EventEmitter, PlaybackEvent, StopReason};
use crate::playback::encoder::{
    EncoderExit, EncoderLauncher, EncoderRequest, EncoderState, EncoderSupervisor, ExitNotice,
    LiveInput,
};
use crate::playback::session::{PausedSession, PlaybackSession, PlaylistQueue, SourceRef};
use crate::state::Config;
use crate::types::PlaybackMode;
use crate::utils::now_millis;
use crate::zones::ZoneGate;

/// Resolves remote media references (page URLs, share links) into something
/// the encoder can read directly.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> ZonecastResult<String>;

    /// Drops any cached resolution for `url`; called after a crash since
    /// resolved media links tend to expire.
    fn purge(&self, url: &str);
}

/// Hands URLs to the encoder unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughResolver;

#[async_trait]
impl MediaResolver for PassthroughResolver {
    async fn resolve(&self, url: &str) -> ZonecastResult<String> {
        Ok(url.to_string())
    }

    fn purge(&self, _url: &str) {}
}

/// Handle returned by a successful start.
pub struct StartedSession {
    pub session_id: String,
    pub mode: PlaybackMode,
    /// Present for mic sessions.
    pub input: Option<LiveInput>,
}

/// Point-in-time view of the arbiter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatus {
    pub mode: PlaybackMode,
    pub session_id: Option<String>,
    pub source: Option<SourceRef>,
    pub elapsed_ms: Option<u64>,
    /// A start or stop is in progress.
    pub transitioning: bool,
    pub paused: Option<PausedSession>,
    pub playlist: Option<PlaylistStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistStatus {
    pub index: isize,
    pub length: usize,
    pub looping: bool,
}

/// Who asked for a start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOrigin {
    User,
    Resume,
    /// Playlist advance or crash retry, on behalf of session `generation`.
    Auto {
        generation: u64,
        prior_reason: StopReason,
    },
}

#[derive(Debug, Clone)]
struct StartPlan {
    mode: PlaybackMode,
    source: SourceRef,
    seek_ms: u64,
    /// Replaces the playlist queue on admission.
    queue: Option<PlaylistQueue>,
    track_index: Option<usize>,
}

impl StartPlan {
    fn new(mode: PlaybackMode, source: SourceRef) -> Self {
        Self {
            mode,
            source,
            seek_ms: 0,
            queue: None,
            track_index: None,
        }
    }
}

struct PendingAction {
    plan: StartPlan,
    origin: StartOrigin,
}

#[derive(Default)]
struct ArbiterState {
    session: Option<PlaybackSession>,
    /// Mode of the start/stop currently in progress.
    in_flight: Option<PlaybackMode>,
    paused: Option<PausedSession>,
    playlist: Option<PlaylistQueue>,
    pending: Option<PendingAction>,
    retry_attempts: u32,
}

/// What to do about an unrequested encoder exit.
enum ExitDecision {
    Advance { generation: u64 },
    Retry { plan: StartPlan, generation: u64, attempt: u32 },
    Teardown { generation: u64, reason: StopReason, error: Option<String> },
}

struct ArbiterTiming {
    mic_grace: Duration,
    track_settle: Duration,
    retry_delay: Duration,
    max_retries: u32,
    retry_reset: Duration,
    start_wait: Duration,
    retry_on_crash: bool,
}

/// Single owner of the encoder and the active playback session.
pub struct PlaybackArbiter {
    encoder: EncoderSupervisor,
    zones: Arc<dyn ZoneGate>,
    resolver: Arc<dyn MediaResolver>,
    emitter: Arc<dyn EventEmitter>,
    timing: ArbiterTiming,
    state: Mutex<ArbiterState>,
    /// `true` while a start or stop is in flight.
    busy: watch::Sender<bool>,
}

impl PlaybackArbiter {
    /// Creates the arbiter and the exit-notice receiver to feed into
    /// [`Self::run_exit_dispatch`].
    pub fn new(
        config: &Config,
        launcher: Arc<dyn EncoderLauncher>,
        zones: Arc<dyn ZoneGate>,
        resolver: Arc<dyn MediaResolver>,
        emitter: Arc<dyn EventEmitter>,
    ) -> (Self, mpsc::UnboundedReceiver<ExitNotice>) {
        let (encoder, notices) = EncoderSupervisor::new(
            launcher,
            config.encoder_kill_timeout(),
            config.encoder.live_input_capacity,
            Arc::clone(&emitter),
        );
        let (busy, _) = watch::channel(false);
        (
            Self {
                encoder,
                zones,
                resolver,
                emitter,
                timing: ArbiterTiming {
                    mic_grace: config.mic_preempt_grace(),
                    track_settle: config.track_settle_delay(),
                    retry_delay: config.remote_retry_delay(),
                    max_retries: config.remote_max_retries,
                    retry_reset: config.retry_reset_after(),
                    start_wait: config.start_wait(),
                    retry_on_crash: config.retry_on_crash,
                },
                state: Mutex::new(ArbiterState::default()),
                busy,
            },
            notices,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Starts
    // ─────────────────────────────────────────────────────────────────────────

    /// Takes the encoder for live PCM, preempting any other source.
    pub async fn start_mic(self: &Arc<Self>, sample_rate: u32, channels: u16) -> ZonecastResult<StartedSession> {
        if sample_rate == 0 || channels == 0 {
            return Err(ZonecastError::Validation(
                "sample rate and channel count must be positive".into(),
            ));
        }
        let plan = StartPlan::new(
            PlaybackMode::Mic,
            SourceRef::Live {
                sample_rate,
                channels,
            },
        );
        self.start_user(plan, StartOrigin::User).await
    }

    /// Plays a scheduled track. Rejected while the mic is live.
    pub async fn start_schedule(self: &Arc<Self>, track: PathBuf) -> ZonecastResult<StartedSession> {
        let plan = StartPlan::new(PlaybackMode::Schedule, SourceRef::File { path: track });
        self.start_user(plan, StartOrigin::User).await
    }

    /// Plays `tracks` in order, starting with the first.
    pub async fn start_playlist(self: &Arc<Self>, tracks: Vec<PathBuf>, looping: bool) -> ZonecastResult<StartedSession> {
        let mut queue = PlaylistQueue::new(tracks, looping)
            .ok_or_else(|| ZonecastError::Validation("playlist has no tracks".into()))?;
        let first = queue
            .advance()
            .cloned()
            .ok_or_else(|| ZonecastError::Validation("playlist has no tracks".into()))?;
        let mut plan = StartPlan::new(PlaybackMode::Playlist, SourceRef::File { path: first });
        plan.queue = Some(queue);
        plan.track_index = Some(0);
        self.start_user(plan, StartOrigin::User).await
    }

    pub async fn start_file(self: &Arc<Self>, path: PathBuf) -> ZonecastResult<StartedSession> {
        let plan = StartPlan::new(PlaybackMode::File, SourceRef::File { path });
        self.start_user(plan, StartOrigin::User).await
    }

    pub async fn start_remote(self: &Arc<Self>, url: String) -> ZonecastResult<StartedSession> {
        if url.trim().is_empty() {
            return Err(ZonecastError::Validation("remote media URL is empty".into()));
        }
        let plan = StartPlan::new(PlaybackMode::Remote, SourceRef::Remote { url });
        self.start_user(plan, StartOrigin::User).await
    }

    async fn start_user(self: &Arc<Self>, plan: StartPlan, origin: StartOrigin) -> ZonecastResult<StartedSession> {
        self.start_session(plan, origin)
            .await?
            .ok_or_else(|| ZonecastError::Internal("user start was deferred".into()))
    }

    fn start_boxed(
        self: Arc<Self>,
        plan: StartPlan,
        origin: StartOrigin,
    ) -> BoxFuture<'static, ZonecastResult<Option<StartedSession>>> {
        Box::pin(async move { self.start_session(plan, origin).await })
    }

    /// Start protocol: gate, claim, stop prior, spawn, record, announce.
    ///
    /// Returns `Ok(None)` when an automatic start was parked in the pending
    /// slot or found its session already replaced.
    async fn start_session(
        self: &Arc<Self>,
        mut plan: StartPlan,
        origin: StartOrigin,
    ) -> ZonecastResult<Option<StartedSession>> {
        let mode = plan.mode;
        if !self.zones.any_stream_enabled() {
            log::info!("[Arbiter] Refusing {} start: streaming disabled on every zone", mode);
            return Err(ZonecastError::StreamDisabled);
        }

        if mode == PlaybackMode::Mic {
            self.wait_for_settle().await;
        }

        let prior = {
            let mut state = self.state.lock();

            if let Some(in_flight) = state.in_flight {
                if let StartOrigin::Auto { .. } = origin {
                    log::info!("[Arbiter] {} transition in flight, parking {} restart", in_flight, mode);
                    state.pending = Some(PendingAction { plan, origin });
                    return Ok(None);
                }
                return Err(self.busy_error(in_flight, mode));
            }

            if let StartOrigin::Auto { generation, .. } = origin {
                if state.session.as_ref().map(|s| s.generation) != Some(generation) {
                    log::debug!("[Arbiter] Dropping stale {} restart for generation {}", mode, generation);
                    return Ok(None);
                }
            }

            if let Some(active) = state.session.as_ref().map(|s| s.mode) {
                self.admit(active, mode)?;
            }

            state.in_flight = Some(mode);
            if let Some(queue) = plan.queue.take() {
                state.playlist = Some(queue);
            } else if mode != PlaybackMode::Playlist {
                state.playlist = None;
            }
            state.paused = None;
            if !matches!(origin, StartOrigin::Auto { .. }) {
                state.retry_attempts = 0;
            }
            state.session.take()
        };
        self.busy.send_replace(true);

        // The encoder may still run (or be between tracks); always vacate it.
        if let Err(e) = self.encoder.stop().await {
            log::warn!("[Arbiter] Stopping previous encoder failed: {}", e);
        }
        let preempted = prior.is_some();
        if let Some(prior) = prior {
            let reason = match origin {
                StartOrigin::Auto { prior_reason, .. } => prior_reason,
                _ if prior.mode == mode => StopReason::Requested,
                _ => StopReason::Preempted,
            };
            log::info!("[Arbiter] Session {} ({}) stopped: {:?}", prior.id, prior.mode, reason);
            self.emit_stopped(&prior, reason);
        }

        if mode == PlaybackMode::Mic && preempted {
            tokio::time::sleep(self.timing.mic_grace).await;
        }

        let launched = match self.encoder_request(&plan).await {
            Ok(request) => self.encoder.start(&request).await.map_err(ZonecastError::from),
            Err(e) => Err(e),
        };

        match launched {
            Ok((generation, input)) => {
                let session = PlaybackSession::new(mode, plan.source.clone(), plan.seek_ms, generation);
                let started = StartedSession {
                    session_id: session.id.clone(),
                    mode,
                    input,
                };
                log::info!(
                    "[Arbiter] Session {} started: {} {} @{}ms",
                    session.id,
                    mode,
                    plan.source.describe(),
                    plan.seek_ms
                );
                let pending = {
                    let mut state = self.state.lock();
                    state.session = Some(session);
                    state.in_flight = None;
                    state.pending.take()
                };
                self.busy.send_replace(false);

                self.emitter.emit_playback(PlaybackEvent::Started {
                    session_id: started.session_id.clone(),
                    mode,
                    source: plan.source.describe(),
                    offset_ms: plan.seek_ms,
                    timestamp: now_millis(),
                });
                if let Some(index) = plan.track_index {
                    self.emitter.emit_playback(PlaybackEvent::TrackChanged {
                        index,
                        track: plan.source.describe(),
                        timestamp: now_millis(),
                    });
                }
                self.zones.playback_changed(mode).await;
                self.run_pending(pending);
                Ok(Some(started))
            }
            Err(e) => {
                log::warn!("[Arbiter] {} start failed: {}", mode, e);
                let pending = {
                    let mut state = self.state.lock();
                    state.in_flight = None;
                    if mode == PlaybackMode::Playlist {
                        state.playlist = None;
                    }
                    state.pending.take()
                };
                self.busy.send_replace(false);

                self.emitter.emit_playback(PlaybackEvent::Error {
                    mode,
                    message: e.to_string(),
                    timestamp: now_millis(),
                });
                self.zones.playback_changed(PlaybackMode::None).await;
                self.run_pending(pending);
                Err(e)
            }
        }
    }

    /// Mode rules for a start while `active` holds the encoder.
    fn admit(&self, active: PlaybackMode, requested: PlaybackMode) -> ZonecastResult<()> {
        match requested {
            PlaybackMode::Mic => Ok(()),
            PlaybackMode::Schedule if active == PlaybackMode::Mic => Err(self.busy_error(active, requested)),
            PlaybackMode::Schedule => Ok(()),
            _ if active == requested => Ok(()),
            _ => Err(self.busy_error(active, requested)),
        }
    }

    fn busy_error(&self, active: PlaybackMode, requested: PlaybackMode) -> ZonecastError {
        if requested == PlaybackMode::Schedule {
            log::info!("[Arbiter] Schedule trigger rejected: {} is active", active);
            self.emitter.emit_playback(PlaybackEvent::Rejected {
                requested_mode: requested,
                active_mode: active,
                reason: format!("{} is active", active),
                timestamp: now_millis(),
            });
        }
        ZonecastError::ModeBusy {
            active_mode: active,
            requested_mode: requested,
        }
    }

    async fn encoder_request(&self, plan: &StartPlan) -> ZonecastResult<EncoderRequest> {
        let resolved = match &plan.source {
            SourceRef::Remote { url } => Some(self.resolver.resolve(url).await?),
            _ => None,
        };
        Ok(EncoderRequest {
            source: plan.source.to_encoder_source(plan.seek_ms, resolved),
        })
    }

    /// Waits (bounded) until no start or stop is in flight.
    async fn wait_for_settle(&self) {
        let mut busy = self.busy.subscribe();
        if !*busy.borrow() {
            return;
        }
        log::debug!("[Arbiter] Waiting for in-flight transition");
        if tokio::time::timeout(self.timing.start_wait, busy.wait_for(|b| !*b))
            .await
            .is_err()
        {
            log::warn!(
                "[Arbiter] In-flight transition did not settle within {:?}",
                self.timing.start_wait
            );
        }
    }

    fn run_pending(self: &Arc<Self>, pending: Option<PendingAction>) {
        let Some(pending) = pending else { return };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mode = pending.plan.mode;
            if let Err(e) = this.start_boxed(pending.plan, pending.origin).await {
                log::warn!("[Arbiter] Deferred {} restart failed: {}", mode, e);
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stop / Pause / Resume
    // ─────────────────────────────────────────────────────────────────────────

    /// Stops whatever is playing and forgets any paused session or playlist.
    pub async fn stop(&self) -> ZonecastResult<()> {
        self.stop_matching(None, StopReason::Requested).await.map(|_| ())
    }

    /// Stops the session only if it is still `session_id`. Returns whether it
    /// was stopped.
    pub async fn stop_session(&self, session_id: &str) -> ZonecastResult<bool> {
        self.stop_matching(Some(session_id), StopReason::Requested).await
    }

    async fn stop_matching(&self, expected: Option<&str>, reason: StopReason) -> ZonecastResult<bool> {
        self.wait_for_settle().await;

        let session = {
            let mut state = self.state.lock();
            if let Some(in_flight) = state.in_flight {
                return Err(ZonecastError::ModeBusy {
                    active_mode: in_flight,
                    requested_mode: PlaybackMode::None,
                });
            }
            if let Some(expected) = expected {
                if state.session.as_ref().map(|s| s.id.as_str()) != Some(expected) {
                    return Ok(false);
                }
            }
            state.paused = None;
            state.playlist = None;
            state.pending = None;
            let session = state.session.take();
            if let Some(session) = &session {
                state.in_flight = Some(session.mode);
            }
            session
        };
        let Some(session) = session else {
            return Ok(false);
        };
        self.busy.send_replace(true);

        let stopped = self.encoder.stop().await;

        self.state.lock().in_flight = None;
        self.busy.send_replace(false);

        if let Err(e) = &stopped {
            log::warn!("[Arbiter] Encoder stop failed: {}", e);
        }
        log::info!("[Arbiter] Session {} ({}) stopped", session.id, session.mode);
        self.emit_stopped(&session, reason);
        self.zones.playback_changed(PlaybackMode::None).await;
        stopped.map(|_| true).map_err(ZonecastError::from)
    }

    /// Freezes the elapsed position, stops the encoder and keeps a resumable
    /// record. Only schedule, file and playlist sessions can pause.
    pub async fn pause(&self) -> ZonecastResult<PausedSession> {
        let paused = {
            let mut state = self.state.lock();
            if let Some(in_flight) = state.in_flight {
                return Err(ZonecastError::ModeBusy {
                    active_mode: in_flight,
                    requested_mode: in_flight,
                });
            }
            let paused = match state.session.as_ref() {
                None => return Err(ZonecastError::Validation("nothing is playing".into())),
                Some(session) if !session.mode.is_pausable() => {
                    return Err(ZonecastError::UnsupportedOperation(format!(
                        "{} sessions cannot be paused",
                        session.mode
                    )));
                }
                Some(session) => PausedSession {
                    mode: session.mode,
                    source: session.source.clone(),
                    resume_ms: session.elapsed_ms(),
                },
            };
            state.in_flight = Some(paused.mode);
            state.paused = Some(paused.clone());
            state.pending = None;
            paused
        };
        self.busy.send_replace(true);

        let stopped = self.encoder.stop().await;

        let session = {
            let mut state = self.state.lock();
            state.in_flight = None;
            state.session.take()
        };
        self.busy.send_replace(false);

        if let Err(e) = stopped {
            log::warn!("[Arbiter] Encoder stop during pause failed: {}", e);
        }
        if let Some(session) = &session {
            self.emit_stopped(session, StopReason::Paused);
        }
        log::info!("[Arbiter] Paused {} at {}ms", paused.mode, paused.resume_ms);
        self.emitter.emit_playback(PlaybackEvent::Paused {
            mode: paused.mode,
            position_ms: paused.resume_ms,
            timestamp: now_millis(),
        });
        self.zones.playback_changed(PlaybackMode::None).await;
        Ok(paused)
    }

    /// Restarts the paused session, seeking to where it was paused.
    pub async fn resume(self: &Arc<Self>) -> ZonecastResult<StartedSession> {
        let paused = {
            let mut state = self.state.lock();
            match state.paused.take() {
                Some(paused) => paused,
                None => {
                    return Err(match state.session.as_ref().map(|s| s.mode) {
                        Some(mode) if !mode.is_pausable() => ZonecastError::UnsupportedOperation(
                            format!("{} sessions cannot be resumed", mode),
                        ),
                        _ => ZonecastError::Validation("nothing is paused".into()),
                    });
                }
            }
        };

        let mut plan = StartPlan::new(paused.mode, paused.source.clone());
        plan.seek_ms = paused.resume_ms;
        match self.start_user(plan, StartOrigin::Resume).await {
            Ok(started) => {
                self.emitter.emit_playback(PlaybackEvent::Resumed {
                    mode: paused.mode,
                    position_ms: paused.resume_ms,
                    timestamp: now_millis(),
                });
                Ok(started)
            }
            Err(e) => {
                let mut state = self.state.lock();
                if state.session.is_none() && state.paused.is_none() {
                    state.paused = Some(paused);
                }
                Err(e)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Playlist navigation
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn next_track(self: &Arc<Self>) -> ZonecastResult<StartedSession> {
        self.skip_track(true).await
    }

    pub async fn previous_track(self: &Arc<Self>) -> ZonecastResult<StartedSession> {
        self.skip_track(false).await
    }

    /// Moves a copy of the queue; admission commits it, so a refused start
    /// leaves the playing index alone.
    async fn skip_track(self: &Arc<Self>, forward: bool) -> ZonecastResult<StartedSession> {
        let (track, queue) = {
            let state = self.state.lock();
            if let Some(in_flight) = state.in_flight {
                return Err(ZonecastError::ModeBusy {
                    active_mode: in_flight,
                    requested_mode: PlaybackMode::Playlist,
                });
            }
            if state.session.as_ref().map(|s| s.mode) != Some(PlaybackMode::Playlist) {
                return Err(ZonecastError::Validation("no playlist is playing".into()));
            }
            let Some(mut queue) = state.playlist.clone() else {
                return Err(ZonecastError::Validation("no playlist is playing".into()));
            };
            let track = if forward { queue.advance() } else { queue.previous() };
            let Some(track) = track.cloned() else {
                return Err(ZonecastError::Validation("already at the last track".into()));
            };
            (track, queue)
        };

        let mut plan = StartPlan::new(PlaybackMode::Playlist, SourceRef::File { path: track });
        plan.track_index = Some(queue.current_index().max(0) as usize);
        plan.queue = Some(queue);
        self.start_user(plan, StartOrigin::User).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Encoder exits
    // ─────────────────────────────────────────────────────────────────────────

    /// Consumes exit notices until cancelled.
    pub async fn run_exit_dispatch(
        self: Arc<Self>,
        mut notices: mpsc::UnboundedReceiver<ExitNotice>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notice = notices.recv() => match notice {
                    Some(notice) => self.handle_exit(notice).await,
                    None => break,
                },
            }
        }
        log::debug!("[Arbiter] Exit dispatch stopped");
    }

    /// Reacts to an encoder exit nobody asked for: advance the playlist,
    /// retry, or tear the session down.
    pub async fn handle_exit(self: &Arc<Self>, notice: ExitNotice) {
        if notice.requested {
            return;
        }

        let decision = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(session) = state.session.as_ref() else {
                return;
            };
            if session.generation != notice.generation {
                log::debug!("[Arbiter] Ignoring exit of stale child {}", notice.generation);
                return;
            }
            let generation = session.generation;
            let mode = session.mode;

            match (mode, notice.exit) {
                (PlaybackMode::Playlist, EncoderExit::Clean) => ExitDecision::Advance { generation },
                (_, EncoderExit::Clean) => ExitDecision::Teardown {
                    generation,
                    reason: StopReason::Ended,
                    error: None,
                },
                (PlaybackMode::Mic, EncoderExit::Crashed { code }) => ExitDecision::Teardown {
                    generation,
                    reason: StopReason::Crashed,
                    error: Some(format!("live encoder exited with {:?}", code)),
                },
                (mode, EncoderExit::Crashed { code }) => {
                    let retryable = mode == PlaybackMode::Remote || self.timing.retry_on_crash;
                    if session.started_at.elapsed() >= self.timing.retry_reset {
                        state.retry_attempts = 0;
                    }
                    if retryable && state.retry_attempts < self.timing.max_retries {
                        state.retry_attempts += 1;
                        let mut plan = StartPlan::new(mode, session.source.clone());
                        if mode != PlaybackMode::Remote {
                            plan.seek_ms = session.elapsed_ms();
                        }
                        ExitDecision::Retry {
                            plan,
                            generation,
                            attempt: state.retry_attempts,
                        }
                    } else {
                        let message = if retryable {
                            format!("encoder crashed ({:?}), giving up after {} retries", code, state.retry_attempts)
                        } else {
                            format!("encoder crashed ({:?})", code)
                        };
                        ExitDecision::Teardown {
                            generation,
                            reason: StopReason::Crashed,
                            error: Some(message),
                        }
                    }
                }
            }
        };

        match decision {
            ExitDecision::Advance { generation } => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(this.timing.track_settle).await;
                    this.advance_playlist(generation).await;
                });
            }
            ExitDecision::Retry {
                plan,
                generation,
                attempt,
            } => {
                if let SourceRef::Remote { url } = &plan.source {
                    self.resolver.purge(url);
                }
                log::warn!(
                    "[Arbiter] {} encoder crashed, retry {}/{} in {:?}",
                    plan.mode,
                    attempt,
                    self.timing.max_retries,
                    self.timing.retry_delay
                );
                self.emitter.emit_playback(PlaybackEvent::Retrying {
                    mode: plan.mode,
                    attempt,
                    delay_ms: self.timing.retry_delay.as_millis() as u64,
                    timestamp: now_millis(),
                });
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(this.timing.retry_delay).await;
                    let origin = StartOrigin::Auto {
                        generation,
                        prior_reason: StopReason::Crashed,
                    };
                    this.restart(plan, origin).await;
                });
            }
            ExitDecision::Teardown {
                generation,
                reason,
                error,
            } => self.teardown(generation, reason, error).await,
        }
    }

    async fn advance_playlist(self: &Arc<Self>, generation: u64) {
        let next = {
            let mut state = self.state.lock();
            if state.session.as_ref().map(|s| s.generation) != Some(generation) {
                return;
            }
            state
                .playlist
                .as_mut()
                .and_then(|queue| queue.advance().cloned().map(|t| (t, queue.current_index().max(0) as usize)))
        };

        match next {
            Some((track, index)) => {
                let mut plan = StartPlan::new(PlaybackMode::Playlist, SourceRef::File { path: track });
                plan.track_index = Some(index);
                let origin = StartOrigin::Auto {
                    generation,
                    prior_reason: StopReason::Ended,
                };
                self.restart(plan, origin).await;
            }
            None => {
                log::info!("[Arbiter] Playlist finished");
                self.teardown(generation, StopReason::Ended, None).await;
            }
        }
    }

    async fn restart(self: &Arc<Self>, plan: StartPlan, origin: StartOrigin) {
        let StartOrigin::Auto { generation, .. } = origin else {
            return;
        };
        let mode = plan.mode;
        match self.start_session(plan, origin).await {
            Ok(_) => {}
            Err(ZonecastError::StreamDisabled) => {
                self.teardown(generation, StopReason::StreamDisabled, None).await;
            }
            Err(e) => log::warn!("[Arbiter] Automatic {} restart failed: {}", mode, e),
        }
    }

    /// Ends session `generation` whose encoder already exited.
    async fn teardown(&self, generation: u64, reason: StopReason, error: Option<String>) {
        let session = {
            let mut state = self.state.lock();
            if state.session.as_ref().map(|s| s.generation) != Some(generation) {
                return;
            }
            state.playlist = None;
            state.pending = None;
            state.session.take()
        };
        let Some(session) = session else { return };

        log::info!("[Arbiter] Session {} ({}) ended: {:?}", session.id, session.mode, reason);
        if let Some(message) = error {
            self.emitter.emit_playback(PlaybackEvent::Error {
                mode: session.mode,
                message,
                timestamp: now_millis(),
            });
        }
        self.emit_stopped(&session, reason);
        self.zones.playback_changed(PlaybackMode::None).await;
    }

    fn emit_stopped(&self, session: &PlaybackSession, reason: StopReason) {
        self.emitter.emit_playback(PlaybackEvent::Stopped {
            session_id: session.id.clone(),
            mode: session.mode,
            reason,
            timestamp: now_millis(),
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn status(&self) -> PlaybackStatus {
        let state = self.state.lock();
        let session = state.session.as_ref();
        PlaybackStatus {
            mode: session.map(|s| s.mode).unwrap_or_default(),
            session_id: session.map(|s| s.id.clone()),
            source: session.map(|s| s.source.clone()),
            elapsed_ms: session.map(PlaybackSession::elapsed_ms),
            transitioning: state.in_flight.is_some(),
            paused: state.paused.clone(),
            playlist: state.playlist.as_ref().map(|q| PlaylistStatus {
                index: q.current_index(),
                length: q.len(),
                looping: q.looping(),
            }),
        }
    }

    pub fn active_mode(&self) -> PlaybackMode {
        let state = self.state.lock();
        state
            .in_flight
            .or_else(|| state.session.as_ref().map(|s| s.mode))
            .unwrap_or_default()
    }

    pub fn encoder_state(&self) -> EncoderState {
        self.encoder.state()
    }

    /// Stops playback for process shutdown.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_matching(None, StopReason::Requested).await {
            log::warn!("[Arbiter] Stop during shutdown failed: {}", e);
        }
    }
}
