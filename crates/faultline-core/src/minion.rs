// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Minion session handler.
//!
//! One session drives one minion connection through
//! `Idle -> Dispatched -> (Committed | Lost)`:
//!
//! ```text
//! Idle        wait for NEED_WORK, take the next job (or answer DIE and stop);
//!             a hang-up while waiting for a job ends the session
//! Dispatched  job is in the registry; WORK_FOLLOWS + payload sent,
//!             waiting for RESULT_FOLLOWS + result
//! Committed   result recorded, back to Idle
//! Lost        connection or protocol failure; job requeued, session ends
//! ```
//!
//! No lock is held while the session talks to the minion.

use faultline_protocol::{Command, ControlMessage, FrameError, FramedStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, instrument, warn};

use crate::campaign::CampaignHandle;
use crate::error::SessionError;
use crate::job::WorkloadId;
use crate::payload::Serializable;

/// Record of the minion on the other end of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Minion {
    /// Peer name, usually `ip:port`.
    pub hostname: String,
    /// Whether a job is out with this minion.
    pub busy: bool,
    /// Job currently out with this minion. Cleared on every exit from
    /// `Dispatched`.
    pub current_job: Option<WorkloadId>,
    /// Results committed over this connection.
    pub completed: u64,
}

impl Minion {
    /// Fresh, idle record.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            busy: false,
            current_job: None,
            completed: 0,
        }
    }
}

/// Where a session is in its per-job cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for NEED_WORK or for a job to become available.
    Idle,
    /// A job is out with the minion.
    Dispatched,
    /// The last job's result was recorded.
    Committed,
    /// The last job was taken back after a failure.
    Lost,
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The campaign had no more work; DIE was sent.
    Dismissed,
    /// The minion hung up while idle.
    Disconnected,
}

/// Outcome of handing out the next job.
enum Dispatch {
    Sent(WorkloadId),
    Dismissed,
    Disconnected,
}

/// Drives one minion connection.
pub struct MinionSession<P, S> {
    campaign: CampaignHandle<P>,
    stream: FramedStream<S>,
    minion: Minion,
    state: SessionState,
}

impl<P, S> MinionSession<P, S>
where
    P: Serializable,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Session over a raw stream.
    pub fn new(campaign: CampaignHandle<P>, stream: S, hostname: impl Into<String>) -> Self {
        Self::from_framed(campaign, FramedStream::new(stream), hostname)
    }

    /// Session over an already framed stream.
    pub fn from_framed(
        campaign: CampaignHandle<P>,
        stream: FramedStream<S>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            campaign,
            stream,
            minion: Minion::new(hostname),
            state: SessionState::Idle,
        }
    }

    /// The minion record.
    pub fn minion(&self) -> &Minion {
        &self.minion
    }

    /// Current position in the per-job cycle.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the minion until it is dismissed, hangs up, or fails.
    ///
    /// A job out with the minion when the session fails is requeued (or
    /// failed, once it has used up its attempts); the error is returned for
    /// the caller's information only.
    #[instrument(skip(self), fields(minion = %self.minion.hostname))]
    pub async fn run(mut self) -> Result<SessionEnd, SessionError> {
        let metrics = self.campaign.state().metrics();
        metrics.active_minions.increment();
        debug!("Minion connected");

        let result = self.serve().await;

        self.campaign.state().metrics().active_minions.decrement();
        match &result {
            Ok(end) => info!(
                ?end,
                completed = self.minion.completed,
                "Minion session finished"
            ),
            Err(e) => warn!(
                error = %e,
                code = e.error_code(),
                state = ?self.state,
                completed = self.minion.completed,
                "Minion session aborted"
            ),
        }
        result
    }

    async fn serve(&mut self) -> Result<SessionEnd, SessionError> {
        loop {
            self.state = SessionState::Idle;

            if !self.await_work_request().await? {
                return Ok(SessionEnd::Disconnected);
            }

            let id = match self.dispatch_next().await? {
                Dispatch::Sent(id) => id,
                Dispatch::Dismissed => return Ok(SessionEnd::Dismissed),
                Dispatch::Disconnected => return Ok(SessionEnd::Disconnected),
            };

            match self.collect_result(id).await {
                Ok(result) => {
                    self.campaign.state().commit(id, result);
                    self.release(SessionState::Committed);
                    self.minion.completed += 1;
                    debug!(workload_id = %id, "Result committed");
                }
                Err(e) => {
                    self.take_back(id, &e);
                    return Err(e);
                }
            }
        }
    }

    /// Wait for NEED_WORK. Returns `false` if the minion hung up cleanly.
    async fn await_work_request(&mut self) -> Result<bool, SessionError> {
        let request: ControlMessage = match self.stream.recv().await {
            Ok(msg) => msg,
            Err(FrameError::ConnectionClosed) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if request.command() != Command::NeedWork {
            return Err(SessionError::UnexpectedCommand {
                expected: Command::NeedWork,
                got: request.command,
            });
        }
        self.check_build_id(request.build_id).await?;
        Ok(true)
    }

    /// Reject a minion from another run, telling it to go away if the
    /// connection still allows it.
    async fn check_build_id(&mut self, got: u64) -> Result<(), SessionError> {
        let expected = self.campaign.build_id();
        if got == expected {
            return Ok(());
        }
        if let Err(e) = self.stream.send(&ControlMessage::die(expected)).await {
            debug!(error = %e, "Could not send DIE to stale minion");
        }
        Err(SessionError::BuildIdMismatch { expected, got })
    }

    /// Take the next job and hand it to the minion.
    ///
    /// Sends DIE when the campaign has no more work. While waiting for a job
    /// the connection is watched too, so a minion that hangs up is not
    /// handed work it will never see.
    async fn dispatch_next(&mut self) -> Result<Dispatch, SessionError> {
        let build_id = self.campaign.build_id();

        let (job, payload) = loop {
            // The minion must stay silent here, so dropping a half-read frame
            // when a job wins only affects a peer already breaking protocol.
            let next = tokio::select! {
                biased;

                incoming = self.stream.recv::<ControlMessage>() => {
                    return match incoming {
                        Ok(msg) => Err(SessionError::Unsolicited { got: msg.command }),
                        Err(FrameError::ConnectionClosed) => {
                            debug!("Minion hung up while waiting for work");
                            Ok(Dispatch::Disconnected)
                        }
                        Err(e) => Err(e.into()),
                    };
                }

                job = self.campaign.state().next_job() => job,
            };

            let Some(job) = next else {
                debug!("No more work, dismissing minion");
                self.stream.send(&ControlMessage::die(build_id)).await?;
                return Ok(Dispatch::Dismissed);
            };
            match job.data.data.encode() {
                Ok(payload) => break (job, payload),
                Err(e) => {
                    error!(
                        workload_id = %job.workload_id(),
                        error = %e,
                        "Failed to encode experiment"
                    );
                    self.campaign.state().fail(job.workload_id());
                }
            }
        };

        let id = job.workload_id();
        if let Err(e) = self.campaign.state().dispatch(job, &self.minion.hostname) {
            error!(workload_id = %id, "Job already in flight, refusing to dispatch it twice");
            return Err(e);
        }
        self.minion.busy = true;
        self.minion.current_job = Some(id);
        self.state = SessionState::Dispatched;

        let sent = async {
            self.stream
                .send(&ControlMessage::work_follows(build_id, id.get()))
                .await?;
            self.stream.send_raw(&payload).await
        }
        .await;
        if let Err(e) = sent {
            // The minion never got the job, so it costs no attempt.
            let err = SessionError::from(e);
            self.campaign.state().requeue_undelivered(id, &err);
            self.release(SessionState::Lost);
            return Err(err);
        }

        debug!(workload_id = %id, size = payload.len(), "Job dispatched");
        Ok(Dispatch::Sent(id))
    }

    /// Wait for RESULT_FOLLOWS and the result payload for `id`.
    async fn collect_result(&mut self, id: WorkloadId) -> Result<P, SessionError> {
        let header: ControlMessage = self.stream.recv().await?;
        if header.command() != Command::ResultFollows {
            return Err(SessionError::UnexpectedCommand {
                expected: Command::ResultFollows,
                got: header.command,
            });
        }
        self.check_build_id(header.build_id).await?;
        if header.workload_id != id.get() {
            return Err(SessionError::WorkloadMismatch {
                expected: id,
                got: header.workload_id,
            });
        }

        let payload = self.stream.recv_raw().await?;
        Ok(P::decode(&payload)?)
    }

    fn take_back(&mut self, id: WorkloadId, reason: &SessionError) {
        if reason.requeues_job() {
            self.campaign.state().lose(id, reason);
        }
        self.release(SessionState::Lost);
    }

    fn release(&mut self, state: SessionState) {
        self.minion.busy = false;
        self.minion.current_job = None;
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::CampaignManager;
    use crate::config::CoordinatorConfig;
    use crate::job::JobState;
    use crate::payload::Json;
    use faultline_protocol::frame::encode_frame;
    use faultline_protocol::{MinionClient, WorkAssignment};
    use prost::Message;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadBuf, duplex};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const BUILD_ID: u64 = 4242;

    type Payload = Json<String>;

    fn campaign(jobs: &[&str], finish: bool) -> CampaignHandle<Payload> {
        limited_campaign(jobs, finish, 0)
    }

    fn limited_campaign(
        jobs: &[&str],
        finish: bool,
        max_attempts: u32,
    ) -> CampaignHandle<Payload> {
        let manager = CampaignManager::new(CoordinatorConfig {
            build_id: BUILD_ID,
            max_attempts,
            ..Default::default()
        });
        let handle = manager.handle();
        for job in jobs {
            handle.add_job(Json(job.to_string())).unwrap();
        }
        if finish {
            handle.finish_filling();
        }
        handle
    }

    fn connect(
        handle: &CampaignHandle<Payload>,
        name: &str,
    ) -> (
        MinionClient<DuplexStream>,
        JoinHandle<Result<SessionEnd, SessionError>>,
    ) {
        let (client, server) = duplex(64 * 1024);
        let session = MinionSession::new(handle.clone(), server, name);
        (MinionClient::new(client), tokio::spawn(session.run()))
    }

    async fn finish(
        session: JoinHandle<Result<SessionEnd, SessionError>>,
    ) -> Result<SessionEnd, SessionError> {
        timeout(Duration::from_secs(5), session)
            .await
            .expect("session did not end")
            .unwrap()
    }

    /// Stream that delivers `incoming` once, then never has more to read,
    /// and refuses every write.
    struct WriteRefused {
        incoming: io::Cursor<Vec<u8>>,
    }

    impl AsyncRead for WriteRefused {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let pos = self.incoming.position() as usize;
            let remaining = &self.incoming.get_ref()[pos..];
            if remaining.is_empty() {
                return Poll::Pending;
            }
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.incoming.set_position((pos + n) as u64);
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for WriteRefused {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn work(assignment: WorkAssignment) -> (u32, String) {
        match assignment {
            WorkAssignment::Work {
                workload_id,
                payload,
            } => (workload_id, Payload::decode(&payload).unwrap().0),
            WorkAssignment::Die => panic!("expected work, got DIE"),
        }
    }

    #[tokio::test]
    async fn test_happy_path_then_dismissed() {
        let handle = campaign(&["flip r0 bit 3", "flip r1 bit 7"], true);
        let (mut minion, session) = connect(&handle, "minion-1");

        for expected in [(1, "flip r0 bit 3"), (2, "flip r1 bit 7")] {
            let (id, experiment) = work(minion.request_work(BUILD_ID).await.unwrap());
            assert_eq!((id, experiment.as_str()), expected);
            let result = Json(format!("{experiment}: masked")).encode().unwrap();
            minion.send_result(BUILD_ID, id, &result).await.unwrap();
        }
        assert_eq!(
            minion.request_work(BUILD_ID).await.unwrap(),
            WorkAssignment::Die
        );

        assert_eq!(finish(session).await.unwrap(), SessionEnd::Dismissed);
        assert!(handle.is_complete());
        let stats = handle.stats();
        assert_eq!(stats.done, 2);
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.active_minions, 0);
    }

    #[tokio::test]
    async fn test_disconnect_while_idle_is_clean() {
        let handle = campaign(&["a"], true);
        let (minion, session) = connect(&handle, "minion-1");
        drop(minion);

        assert_eq!(finish(session).await.unwrap(), SessionEnd::Disconnected);
        assert_eq!(handle.stats().pending, 1);
        assert_eq!(handle.stats().dispatched, 0);
    }

    #[tokio::test]
    async fn test_disconnect_after_dispatch_requeues_job() {
        let handle = campaign(&["a", "b"], true);
        let (mut minion, session) = connect(&handle, "minion-1");

        let (id, _) = work(minion.request_work(BUILD_ID).await.unwrap());
        assert_eq!(id, 1);
        drop(minion);

        let err = finish(session).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(handle.job_state(WorkloadId::new(1)), Some(JobState::Pending));
        assert_eq!(handle.stats().requeued, 1);
        assert_eq!(handle.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_malformed_result_requeues_job() {
        let handle = campaign(&["a"], true);
        let (mut minion, session) = connect(&handle, "minion-1");

        let (id, _) = work(minion.request_work(BUILD_ID).await.unwrap());
        minion.send_result(BUILD_ID, id, b"{not json").await.unwrap();

        let err = finish(session).await.unwrap_err();
        assert!(matches!(err, SessionError::Payload(_)));
        assert_eq!(handle.stats().pending, 1);
        assert_eq!(handle.stats().done, 0);
    }

    #[tokio::test]
    async fn test_result_for_wrong_workload_requeues_job() {
        let handle = campaign(&["a"], true);
        let (mut minion, session) = connect(&handle, "minion-1");

        let (id, _) = work(minion.request_work(BUILD_ID).await.unwrap());
        let result = Json("x".to_string()).encode().unwrap();
        minion.send_result(BUILD_ID, id + 1, &result).await.unwrap();

        let err = finish(session).await.unwrap_err();
        assert_eq!(err.error_code(), "WORKLOAD_MISMATCH");
        assert_eq!(handle.job_state(WorkloadId::new(id)), Some(JobState::Pending));
    }

    #[tokio::test]
    async fn test_stale_build_id_gets_die() {
        let handle = campaign(&["a"], true);
        let (mut minion, session) = connect(&handle, "stale");

        assert_eq!(
            minion.request_work(BUILD_ID + 1).await.unwrap(),
            WorkAssignment::Die
        );

        let err = finish(session).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::BuildIdMismatch { expected: BUILD_ID, got } if got == BUILD_ID + 1
        ));
        assert_eq!(handle.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_unexpected_command_ends_session() {
        let handle = campaign(&["a"], true);
        let (mut minion, session) = connect(&handle, "confused");

        minion
            .framed()
            .send(&ControlMessage::result_follows(BUILD_ID, 1))
            .await
            .unwrap();

        let err = finish(session).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::UnexpectedCommand {
                expected: Command::NeedWork,
                ..
            }
        ));
        assert_eq!(handle.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_idle_session_waits_for_work() {
        let handle = campaign(&[], false);
        let (mut minion, session) = connect(&handle, "minion-1");

        let request = tokio::spawn(async move {
            let assignment = minion.request_work(BUILD_ID).await.unwrap();
            (minion, assignment)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!request.is_finished());

        handle.add_job(Json("late arrival".to_string())).unwrap();
        let (mut minion, assignment) = timeout(Duration::from_secs(5), request)
            .await
            .unwrap()
            .unwrap();
        let (id, experiment) = work(assignment);
        assert_eq!(experiment, "late arrival");

        let result = Json("done".to_string()).encode().unwrap();
        minion.send_result(BUILD_ID, id, &result).await.unwrap();
        handle.finish_filling();
        assert_eq!(
            minion.request_work(BUILD_ID).await.unwrap(),
            WorkAssignment::Die
        );
        assert_eq!(finish(session).await.unwrap(), SessionEnd::Dismissed);
    }

    #[tokio::test]
    async fn test_hang_up_while_waiting_for_work_takes_no_job() {
        let handle = limited_campaign(&[], false, 1);
        let (mut minion, session) = connect(&handle, "ghost");

        minion
            .framed()
            .send(&ControlMessage::need_work(BUILD_ID))
            .await
            .unwrap();
        drop(minion);

        assert_eq!(finish(session).await.unwrap(), SessionEnd::Disconnected);
        assert_eq!(handle.stats().active_minions, 0);

        // Work arriving after the hang-up stays queued for a live minion.
        let id = handle.add_job(Json("late".to_string())).unwrap();
        handle.finish_filling();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(handle.job_state(id), Some(JobState::Pending));
        let stats = handle.stats();
        assert_eq!(stats.dispatched, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.requeued, 0);
    }

    #[tokio::test]
    async fn test_message_while_waiting_for_work_ends_session() {
        let handle = campaign(&[], false);
        let (mut minion, session) = connect(&handle, "impatient");

        for _ in 0..2 {
            minion
                .framed()
                .send(&ControlMessage::need_work(BUILD_ID))
                .await
                .unwrap();
        }

        let err = finish(session).await.unwrap_err();
        assert!(matches!(err, SessionError::Unsolicited { got: 1 }));
        assert_eq!(handle.stats().dispatched, 0);
    }

    #[tokio::test]
    async fn test_undelivered_job_costs_no_attempt() {
        let handle = limited_campaign(&["a"], true, 1);
        let request = encode_frame(&ControlMessage::need_work(BUILD_ID).encode_to_vec()).unwrap();
        let stream = WriteRefused {
            incoming: io::Cursor::new(request.to_vec()),
        };
        let session = MinionSession::new(handle.clone(), stream, "half-open");

        let err = timeout(Duration::from_secs(5), session.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));

        assert_eq!(handle.job_state(WorkloadId::new(1)), Some(JobState::Pending));
        let stats = handle.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.requeued, 1);
        assert!(!handle.is_complete());
    }

    #[test]
    fn test_minion_record_starts_idle() {
        let minion = Minion::new("10.0.0.7:50000");
        assert!(!minion.busy);
        assert_eq!(minion.current_job, None);
        assert_eq!(minion.completed, 0);
    }
}
