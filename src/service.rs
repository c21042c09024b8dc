use crate::buffers::MadBufferPool;
use crate::config::MadConfig;
use crate::error::{ChainSendError, SendError, SubmitError};
use crate::mad_header::{MadHeader, MAD_BLOCK_SIZE};
use crate::reassembly::{Ack, ReassemblyKey, ReassemblyList, SegmentDisposition};
use crate::rmpp::{rmpp_applies, RmppFlags, RmppHeader, RmppProfile, RmppType};
use crate::segmenter::{AckOutcome, Segmenter};
use crate::tid::{RoutingTag, TransactionId};
use crate::transaction::{AvOwnership, OutboundTransaction, RetryBackoff};
use crate::transport::{AvHandle, MadClient, MadTransport, RecvMad, RemoteId, SendCompletion,
                       SendOutcome, SendStatus, WireStatus};
use bytes::BufMut;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant};
use tracing::{debug, trace, warn};

/// One outbound send as submitted by a client.
pub struct SendSpec {
    /// The serialized message: base header, optional RMPP / class headers,
    ///  payload. For RMPP sends this may exceed the MAD block size.
    pub message: Vec<u8>,
    pub remote: RemoteId,
    /// An address vector to reuse; if absent, one is created for this send
    ///  and released with it.
    pub av: Option<AvHandle>,
    pub resp_expected: bool,
    /// Forces RMPP segmentation with the given protocol version even for a
    ///  class / method combination that would not trigger it implicitly.
    pub rmpp_version: Option<u8>,
    /// Overrides for the per-class retry configuration.
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
}

struct ServiceInner {
    /// All accepted sends that have not had their completion callback yet,
    ///  keyed by the routing-tagged transaction id.
    outstanding: BTreeMap<TransactionId, OutboundTransaction>,
    /// Retry deadlines, lazily deleted: entries may refer to transactions
    ///  that completed or had their deadline re-armed in the meantime.
    deadlines: BinaryHeap<Reverse<(Instant, TransactionId)>>,
    reassembly: ReassemblyList,
    /// Transactions the transport refused with a full queue, waiting for a
    ///  resume.
    backlog: VecDeque<TransactionId>,
    /// Per-tid count of segments submitted to the hardware whose completion
    ///  has not arrived yet. A completion whose tid is not recorded here was
    ///  never submitted by this service and must not touch the accounting.
    submitted: FxHashMap<TransactionId, u32>,
}

struct ServiceShared {
    tag: RoutingTag,
    snoop: bool,
    client: Arc<dyn MadClient>,
    transport: Arc<dyn MadTransport>,
    config: Arc<MadConfig>,
    buffer_pool: Arc<MadBufferPool>,
    inner: Mutex<ServiceInner>,
    /// Segments submitted to the hardware whose completion has not been
    ///  routed back yet. Teardown waits for this to drain.
    pending_completions: AtomicUsize,
    shutting_down: AtomicBool,
    sweep_notify: Notify,
}

/// Per-client send/receive state: accepts sends, matches responses, drives
///  retries from a background sweep task, and runs RMPP on both directions.
///  Created by the dispatcher on registration.
pub struct MadService {
    shared: Arc<ServiceShared>,
    sweep_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MadService {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl MadService {
    pub fn new(
        tag: RoutingTag,
        snoop: bool,
        client: Arc<dyn MadClient>,
        transport: Arc<dyn MadTransport>,
        config: Arc<MadConfig>,
        buffer_pool: Arc<MadBufferPool>,
    ) -> MadService {
        let shared = Arc::new(ServiceShared {
            tag,
            snoop,
            client,
            transport,
            config: config.clone(),
            buffer_pool,
            inner: Mutex::new(ServiceInner {
                outstanding: BTreeMap::new(),
                deadlines: BinaryHeap::new(),
                reassembly: ReassemblyList::new(config.rmpp_initial_window, config.rmpp_window_growth),
                backlog: VecDeque::new(),
                submitted: FxHashMap::default(),
            }),
            pending_completions: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            sweep_notify: Notify::new(),
        });

        let sweep_handle = tokio::spawn(ServiceShared::do_loop(shared.clone()));

        MadService {
            shared,
            sweep_handle: std::sync::Mutex::new(Some(sweep_handle)),
        }
    }

    pub fn tag(&self) -> RoutingTag {
        self.shared.tag
    }

    pub fn is_snoop(&self) -> bool {
        self.shared.snoop
    }

    /// Accepts one send, stamps the routing tag into its transaction id, and
    ///  starts transmitting. The returned transaction id identifies the send
    ///  for [MadService::cancel].
    pub async fn send(&self, spec: SendSpec) -> Result<TransactionId, SendError> {
        let tid = self.shared.send_one(spec).await?;
        self.shared.resume_sends().await;
        Ok(tid)
    }

    /// Accepts a chain of sends as one call. On failure, everything before
    ///  the failing element stays accepted and completes individually.
    pub async fn send_chain(&self, specs: Vec<SendSpec>) -> Result<Vec<TransactionId>, ChainSendError> {
        let mut accepted = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            match self.shared.send_one(spec).await {
                Ok(tid) => accepted.push(tid),
                Err(source) => {
                    self.shared.resume_sends().await;
                    return Err(ChainSendError { accepted, index, source });
                }
            }
        }
        self.shared.resume_sends().await;
        Ok(accepted)
    }

    /// Marks an outstanding send canceled. An idle send is completed as
    ///  canceled right away; one with a segment in flight is completed when
    ///  that segment's completion arrives.
    pub async fn cancel(&self, tid: TransactionId) {
        self.shared.cancel(tid).await;
    }

    pub async fn process_send_completion(&self, completion: SendCompletion) {
        self.shared.process_send_completion(completion).await;
    }

    pub async fn process_receive(&self, mad: RecvMad) {
        self.shared.process_receive(mad).await;
    }

    /// Force-completes everything still outstanding as flushed, then waits
    ///  (bounded) for hardware completions of already submitted segments to
    ///  drain, so no callback can fire into a torn-down client.
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let outcomes = {
            let mut inner = self.shared.inner.lock().await;
            inner.deadlines.clear();
            inner.backlog.clear();
            inner.reassembly.clear(&self.shared.buffer_pool);

            let tids = inner.outstanding.keys().cloned().collect::<Vec<_>>();
            tids.into_iter()
                .filter_map(|tid| self.shared.complete(&mut inner, tid, SendStatus::Flushed))
                .collect::<Vec<_>>()
        };
        self.shared.fire_callbacks(outcomes).await;

        let give_up_at = Instant::now() + self.shared.config.teardown_timeout;
        while self.shared.pending_completions.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= give_up_at {
                warn!("teardown: {} hardware completions still pending, giving up on them",
                    self.shared.pending_completions.load(Ordering::SeqCst));
                break;
            }
            sleep(self.shared.config.teardown_poll_interval).await;
        }

        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl ServiceShared {
    async fn send_one(&self, spec: SendSpec) -> Result<TransactionId, SendError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SendError::ShuttingDown);
        }
        if spec.message.len() < MadHeader::SERIALIZED_LEN {
            return Err(SendError::TooShort(spec.message.len()));
        }
        if let Some(version) = spec.rmpp_version {
            if version != RmppHeader::VERSION_1 {
                return Err(SendError::UnsupportedRmppVersion(version));
            }
        }

        let mut message = spec.message;
        let header = MadHeader::deser(&mut &message[..])
            .map_err(|_| SendError::TooShort(message.len()))?;

        let segmenter = if rmpp_applies(&header, spec.rmpp_version, &message) {
            Some(Segmenter::new(
                RmppProfile::for_class(header.mgmt_class),
                spec.rmpp_version.unwrap_or(RmppHeader::VERSION_1),
                message.len(),
                self.config.rmpp_initial_window,
            ))
        }
        else {
            if message.len() > MAD_BLOCK_SIZE {
                return Err(SendError::TooLong(message.len()));
            }
            None
        };

        let tid = header.tid.with_routing_tag(self.tag);
        MadHeader::overwrite_tid(&mut message, tid);

        let (av, av_ownership) = match spec.av {
            Some(av) => (av, AvOwnership::Borrowed),
            None => {
                let av = self.transport.acquire_address_vector(spec.remote)
                    .map_err(SendError::AddressVector)?;
                (av, AvOwnership::Created)
            }
        };

        let class_config = self.config.get_effective_class_config(header.mgmt_class);
        let initial_timeout = spec.timeout.unwrap_or(class_config.initial_timeout);

        let transaction = OutboundTransaction {
            tid,
            remote: spec.remote,
            mgmt_class: header.mgmt_class,
            class_version: header.class_version,
            resp_expected: spec.resp_expected,
            message,
            segmenter,
            retries_left: spec.retries.unwrap_or(class_config.retries),
            backoff: RetryBackoff::new(initial_timeout, class_config.max_timeout),
            deadline: None,
            in_flight_segs: 0,
            canceled: false,
            response: None,
            av,
            av_ownership,
        };

        let outcomes = {
            let mut inner = self.inner.lock().await;
            inner.outstanding.insert(tid, transaction);
            trace!("accepted send {} to {}", tid, spec.remote);

            let mut outcomes = Vec::new();
            self.transmit(&mut inner, tid, &mut outcomes).await;
            outcomes
        };
        self.fire_callbacks(outcomes).await;

        Ok(tid)
    }

    /// Submits everything currently eligible for `tid`: the whole remaining
    ///  RMPP window, or the single message for a non-RMPP send. A full
    ///  transport queue parks the transaction on the backlog with its retry
    ///  deadline armed.
    async fn transmit(
        &self,
        inner: &mut ServiceInner,
        tid: TransactionId,
        outcomes: &mut Vec<SendOutcome>,
    ) {
        loop {
            let Some(transaction) = inner.outstanding.get_mut(&tid) else {
                return;
            };

            let mut buf = self.buffer_pool.get_from_pool();
            match &transaction.segmenter {
                Some(segmenter) => {
                    let Some(seg_num) = segmenter.next_to_send() else {
                        self.buffer_pool.return_to_pool(buf);
                        return;
                    };
                    segmenter.build_segment(seg_num, &transaction.message, &mut buf);
                }
                None => {
                    if transaction.in_flight_segs > 0 {
                        self.buffer_pool.return_to_pool(buf);
                        return;
                    }
                    buf.put_slice(&transaction.message);
                    buf.put_bytes(0, MAD_BLOCK_SIZE - transaction.message.len());
                }
            }

            match self.transport.submit_segment(transaction.av, buf.as_ref()).await {
                Ok(()) => {
                    self.buffer_pool.return_to_pool(buf);
                    if let Some(segmenter) = &mut transaction.segmenter {
                        segmenter.mark_sent();
                    }
                    transaction.in_flight_segs += 1;
                    transaction.deadline = None;
                    *inner.submitted.entry(tid).or_insert(0) += 1;
                    self.pending_completions.fetch_add(1, Ordering::SeqCst);
                    if transaction.segmenter.is_none() {
                        return;
                    }
                }
                Err(SubmitError::QueueFull) => {
                    self.buffer_pool.return_to_pool(buf);
                    debug!("transport queue full, parking {} on the backlog", tid);
                    if !inner.backlog.contains(&tid) {
                        inner.backlog.push_back(tid);
                    }
                    // the retry budget keeps running while parked: a queue
                    //  that stays full ends in a timeout, not a stuck send
                    self.arm_deadline_if_idle(inner, tid);
                    return;
                }
                Err(SubmitError::Fatal(e)) => {
                    self.buffer_pool.return_to_pool(buf);
                    warn!("transport failure for {}: {:#}", tid, e);
                    outcomes.extend(self.complete(inner, tid, SendStatus::Failure));
                    return;
                }
            }
        }
    }

    /// Retries transmission of backlogged transactions.
    async fn resume_sends(&self) {
        let outcomes = {
            let mut inner = self.inner.lock().await;
            let parked = inner.backlog.drain(..).collect::<Vec<_>>();

            let mut outcomes = Vec::new();
            for tid in parked {
                self.transmit(&mut inner, tid, &mut outcomes).await;
            }
            outcomes
        };
        self.fire_callbacks(outcomes).await;
    }

    async fn cancel(&self, tid: TransactionId) {
        let mut inner = self.inner.lock().await;
        let Some(transaction) = inner.outstanding.get_mut(&tid) else {
            debug!("cancel for unknown transaction {}", tid);
            return;
        };

        transaction.canceled = true;
        if transaction.deadline.is_some() {
            // idle: force the sweep to pick it up now
            inner.deadlines.push(Reverse((Instant::now(), tid)));
            self.sweep_notify.notify_one();
        }
        // else: in flight, observed on the next completion
    }

    async fn process_send_completion(&self, completion: SendCompletion) {
        let outcomes = {
            let mut inner = self.inner.lock().await;
            let mut outcomes = Vec::new();

            // a remote-echoed tid can collide with a live local routing tag,
            //  so only completions of recorded submissions touch the counter
            match inner.submitted.get_mut(&completion.tid) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        inner.submitted.remove(&completion.tid);
                    }
                    let _ = self.pending_completions
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
                }
                None => {
                    debug!("completion for a segment {} this service never submitted: dropping",
                        completion.tid);
                    return;
                }
            }

            let Some(transaction) = inner.outstanding.get_mut(&completion.tid) else {
                debug!("send completion for unknown transaction {}: dropping", completion.tid);
                return;
            };
            transaction.in_flight_segs = transaction.in_flight_segs.saturating_sub(1);

            match completion.status {
                WireStatus::Failure => {
                    outcomes.extend(self.complete(&mut inner, completion.tid, SendStatus::Failure));
                }
                WireStatus::Flushed => {
                    outcomes.extend(self.complete(&mut inner, completion.tid, SendStatus::Flushed));
                }
                WireStatus::Success => {
                    if transaction.canceled {
                        outcomes.extend(self.complete(&mut inner, completion.tid, SendStatus::Canceled));
                    }
                    else if transaction.in_flight_segs == 0 {
                        if transaction.is_satisfied() {
                            outcomes.extend(self.complete(&mut inner, completion.tid, SendStatus::Success));
                        }
                        else {
                            if transaction.segmenter.is_some() {
                                self.transmit(&mut inner, completion.tid, &mut outcomes).await;
                            }
                            self.arm_deadline_if_idle(&mut inner, completion.tid);
                        }
                    }
                }
            }
            outcomes
        };
        self.fire_callbacks(outcomes).await;

        // completion processing freed transport capacity
        self.transport.resume().await;
        self.resume_sends().await;
    }

    async fn process_receive(&self, mad: RecvMad) {
        if self.snoop {
            self.client.on_receive(mad).await;
            return;
        }

        let header = match MadHeader::deser(&mut &mad.data[..]) {
            Ok(header) => header,
            Err(_) => {
                debug!("received truncated MAD from {}: dropping", mad.remote);
                return;
            }
        };

        let mad = match self.apply_rmpp(&header, mad).await {
            Some(mad) => mad,
            None => return,
        };

        if header.is_busy() {
            debug!("busy response from {} for {}: absorbing", mad.remote, header.tid);
            return;
        }

        if header.is_response() && header.tid.routing_tag() == self.tag {
            self.match_response(header, mad).await;
        }
        else {
            self.client.on_receive(mad).await;
        }
    }

    /// Runs inbound RMPP processing. Returns the fully assembled message once
    ///  complete, or the input unchanged if it is not RMPP traffic; None means
    ///  the message was consumed by the protocol (partial data, control).
    async fn apply_rmpp(&self, header: &MadHeader, mad: RecvMad) -> Option<RecvMad> {
        if mad.data.len() < RmppHeader::OFFSET + RmppHeader::SERIALIZED_LEN {
            return Some(mad);
        }
        let rmpp_area = &mad.data[RmppHeader::OFFSET..RmppHeader::OFFSET + RmppHeader::SERIALIZED_LEN];
        if rmpp_area[0] != RmppHeader::VERSION_1
            || rmpp_area[2] & RmppFlags::ACTIVE.bits() == 0
        {
            return Some(mad);
        }
        let rmpp = match RmppHeader::deser(&mut &rmpp_area[..]) {
            Ok(rmpp) => rmpp,
            Err(e) => {
                debug!("active RMPP header from {} is malformed ({:#}): dropping", mad.remote, e);
                return None;
            }
        };

        match rmpp.rmpp_type {
            RmppType::Data => self.on_rmpp_data(header, &rmpp, mad).await,
            RmppType::Ack => {
                self.on_rmpp_ack(header, &rmpp).await;
                None
            }
            RmppType::Stop | RmppType::Abort => {
                self.on_rmpp_reject(header, &rmpp).await;
                None
            }
        }
    }

    async fn on_rmpp_data(&self, header: &MadHeader, rmpp: &RmppHeader, mad: RecvMad) -> Option<RecvMad> {
        let profile = RmppProfile::for_class(header.mgmt_class);
        let key = ReassemblyKey {
            tid: header.tid,
            mgmt_class: header.mgmt_class,
            class_version: header.class_version,
            method: header.method,
            remote: mad.remote,
        };

        let disposition = {
            let mut inner = self.inner.lock().await;
            inner.reassembly.on_data(key, profile, rmpp, &mad.data, &self.buffer_pool)
        };

        match disposition {
            SegmentDisposition::Delivered(message, ack) => {
                self.send_rmpp_ack(header, mad.remote, ack).await;
                Some(RecvMad { remote: mad.remote, data: message })
            }
            SegmentDisposition::Accepted(maybe_ack) => {
                if let Some(ack) = maybe_ack {
                    self.send_rmpp_ack(header, mad.remote, ack).await;
                }
                None
            }
            SegmentDisposition::Duplicate(ack) => {
                self.send_rmpp_ack(header, mad.remote, ack).await;
                None
            }
            SegmentDisposition::Dropped => None,
        }
    }

    async fn on_rmpp_ack(&self, header: &MadHeader, rmpp: &RmppHeader) {
        let outcomes = {
            let mut inner = self.inner.lock().await;
            let mut outcomes = Vec::new();

            let Some(transaction) = inner.outstanding.get_mut(&header.tid) else {
                debug!("RMPP ACK for unknown transaction {}: dropping", header.tid);
                return;
            };
            let Some(segmenter) = &mut transaction.segmenter else {
                debug!("RMPP ACK for non-RMPP transaction {}: dropping", header.tid);
                return;
            };

            match segmenter.on_ack(rmpp.seg_num, rmpp.paylen_newwin) {
                AckOutcome::Stale => {}
                AckOutcome::Advanced => {
                    self.transmit(&mut inner, header.tid, &mut outcomes).await;
                }
                AckOutcome::AllAcked => {
                    let transaction = inner.outstanding.get_mut(&header.tid).unwrap();
                    if transaction.in_flight_segs == 0 {
                        if transaction.is_satisfied() {
                            outcomes.extend(self.complete(&mut inner, header.tid, SendStatus::Success));
                        }
                        else {
                            // all data acknowledged, still waiting for the response
                            self.arm_deadline_if_idle(&mut inner, header.tid);
                        }
                    }
                }
            }
            outcomes
        };
        self.fire_callbacks(outcomes).await;
    }

    async fn on_rmpp_reject(&self, header: &MadHeader, rmpp: &RmppHeader) {
        debug!("RMPP {:?} (status {}) for {}", rmpp.rmpp_type, rmpp.rmpp_status, header.tid);

        let mut inner = self.inner.lock().await;
        let Some(transaction) = inner.outstanding.get_mut(&header.tid) else {
            debug!("RMPP {:?} for unknown transaction {}: dropping", rmpp.rmpp_type, header.tid);
            return;
        };

        transaction.canceled = true;
        if transaction.deadline.is_some() {
            inner.deadlines.push(Reverse((Instant::now(), header.tid)));
            self.sweep_notify.notify_one();
        }
    }

    async fn match_response(&self, header: MadHeader, mut mad: RecvMad) {
        let outcome = {
            let mut inner = self.inner.lock().await;

            let matches = inner.outstanding.get(&header.tid)
                .map(|t| t.mgmt_class == header.mgmt_class
                    && t.class_version == header.class_version
                    && t.remote == mad.remote)
                .unwrap_or(false);
            if !matches {
                debug!("response from {} with no matching outstanding send {}: dropping",
                    mad.remote, header.tid);
                return;
            }

            MadHeader::overwrite_tid(&mut mad.data, header.tid.cleared_routing());

            let transaction = inner.outstanding.get_mut(&header.tid).unwrap();
            transaction.response = Some(mad);

            if transaction.in_flight_segs == 0 && transaction.is_satisfied() {
                self.complete(&mut inner, header.tid, SendStatus::Success)
            }
            else {
                // still in flight or segments unacknowledged: the response is
                //  parked and delivered with the transaction's completion
                trace!("holding response for in-flight transaction {}", header.tid);
                None
            }
        };
        if let Some(outcome) = outcome {
            self.fire_callbacks(vec![outcome]).await;
        }
    }

    /// Sends an RMPP ACK (or re-ACK) back to the sender of a DATA segment.
    ///  Internally generated, not tracked as a transaction; failures are
    ///  absorbed and the remote's retry is relied upon.
    async fn send_rmpp_ack(&self, request: &MadHeader, remote: RemoteId, ack: Ack) {
        let av = match self.transport.acquire_address_vector(remote) {
            Ok(av) => av,
            Err(e) => {
                debug!("no address vector for ACK to {} ({:#}): dropping", remote, e);
                return;
            }
        };

        let mut header = request.clone();
        header.method |= crate::mad_header::method::RESPONSE_BIT;
        let rmpp = RmppHeader {
            rmpp_version: RmppHeader::VERSION_1,
            rmpp_type: RmppType::Ack,
            resp_time: 0,
            flags: RmppFlags::ACTIVE,
            rmpp_status: 0,
            seg_num: ack.seg_num,
            paylen_newwin: ack.new_window,
        };

        let mut buf = self.buffer_pool.get_from_pool();
        header.ser(&mut buf);
        rmpp.ser(&mut buf);
        buf.put_bytes(0, MAD_BLOCK_SIZE - buf.len());

        if let Err(e) = self.transport.submit_segment(av, buf.as_ref()).await {
            debug!("failed to submit ACK to {}: {:#}", remote, e);
        }
        self.buffer_pool.return_to_pool(buf);
        self.transport.release_address_vector(av);
    }

    fn arm_deadline_if_idle(&self, inner: &mut ServiceInner, tid: TransactionId) {
        let Some(transaction) = inner.outstanding.get_mut(&tid) else {
            return;
        };
        if transaction.in_flight_segs > 0 || transaction.deadline.is_some() {
            return;
        }
        let at = Instant::now() + transaction.backoff.current();
        transaction.deadline = Some(at);
        inner.deadlines.push(Reverse((at, tid)));
        self.sweep_notify.notify_one();
    }

    /// Removes a transaction and builds its one-shot outcome. Releases the
    ///  address vector if this send created it.
    fn complete(&self, inner: &mut ServiceInner, tid: TransactionId, status: SendStatus) -> Option<SendOutcome> {
        let transaction = inner.outstanding.remove(&tid)?;
        if transaction.av_ownership == AvOwnership::Created {
            self.transport.release_address_vector(transaction.av);
        }
        debug!("transaction {} completed: {:?}", tid, status);
        Some(SendOutcome {
            tid: tid.cleared_routing(),
            status,
            response: transaction.response,
        })
    }

    async fn fire_callbacks(&self, outcomes: Vec<SendOutcome>) {
        for outcome in outcomes {
            self.client.on_send_complete(outcome).await;
        }
    }

    /// One pass over elapsed deadlines: canceled transactions are completed,
    ///  elapsed ones with retries left are resent from the first
    ///  unacknowledged segment, exhausted ones are timed out.
    async fn run_sweep(&self) {
        let now = Instant::now();

        let outcomes = {
            let mut inner = self.inner.lock().await;
            let mut outcomes = Vec::new();

            loop {
                match inner.deadlines.peek() {
                    Some(&Reverse((at, _))) if at <= now => {}
                    _ => break,
                }
                let Some(Reverse((at, tid))) = inner.deadlines.pop() else {
                    break;
                };

                let Some(transaction) = inner.outstanding.get_mut(&tid) else {
                    continue; // stale heap entry
                };

                if transaction.canceled && transaction.in_flight_segs == 0 {
                    outcomes.extend(self.complete(&mut inner, tid, SendStatus::Canceled));
                    continue;
                }
                if transaction.deadline != Some(at) {
                    continue; // deadline was re-armed, a newer heap entry exists
                }

                if transaction.retries_left == 0 {
                    outcomes.extend(self.complete(&mut inner, tid, SendStatus::TimedOut));
                    continue;
                }

                transaction.retries_left -= 1;
                transaction.backoff.advance();
                transaction.deadline = None;
                if let Some(segmenter) = &mut transaction.segmenter {
                    segmenter.rewind_for_retry();
                }
                trace!("retrying {} ({} retries left)", tid, transaction.retries_left);
                self.transmit(&mut inner, tid, &mut outcomes).await;
                self.arm_deadline_if_idle(&mut inner, tid);
            }
            outcomes
        };
        self.fire_callbacks(outcomes).await;
    }

    async fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().await;
        inner.deadlines.peek().map(|Reverse((at, _))| *at)
    }

    async fn do_loop(shared: Arc<ServiceShared>) {
        let mut reassembly_interval = interval(shared.config.reassembly_sweep_interval);
        reassembly_interval.tick().await; // the first tick fires immediately

        loop {
            let next_deadline = shared.next_deadline().await;
            select! {
                _ = shared.sweep_notify.notified() => {
                    shared.run_sweep().await;
                }
                _ = async {
                    match next_deadline {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    shared.run_sweep().await;
                }
                _ = reassembly_interval.tick() => {
                    let mut inner = shared.inner.lock().await;
                    inner.reassembly.sweep(&shared.buffer_pool);
                }
            }
        }
    }
}
