use crate::buffers::MadBufferPool;
use crate::config::MadConfig;
use crate::error::{RegisterError, RouteError};
use crate::mad_header::{method, mgmt_class, MadHeader, MAD_BLOCK_SIZE};
use crate::rmpp::{RmppFlags, RmppHeader, RmppType};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::service::MadService;
use crate::tid::RoutingTag;
use crate::transport::{MadClient, MadTransport, RecvMad, SendCompletion};
use bit_set::BitSet;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, span, trace, Instrument, Level, Span};
use uuid::Uuid;

/// What a client asks for when registering on a dispatcher.
pub struct RegistrationSpec {
    pub mgmt_class: u8,
    pub class_version: u8,
    /// Methods this client accepts unsolicited traffic for; None for a
    ///  send-only client.
    pub method_mask: Option<BitSet>,
    /// A snoop client sees every inbound MAD, before and regardless of
    ///  regular routing.
    pub snoop: bool,
    pub client: Arc<dyn MadClient>,
}

struct Registration {
    tag: RoutingTag,
    mgmt_class: u8,
    class_version: u8,
    method_mask: Option<BitSet>,
    /// Set on deregistration. The slot stays occupied until the service has
    ///  drained, so send completions already in flight can still be routed,
    ///  but receive routing treats the registration as gone.
    deregistered: AtomicBool,
    service: Arc<MadService>,
}

#[derive(Default)]
struct DispatchTables {
    /// Dense tag-indexed registration table; index + 1 is the routing tag.
    slots: Vec<Option<Arc<Registration>>>,
    /// version -> class -> method -> owning tag, for traffic that is not
    ///  transaction-correlated.
    unsolicited: FxHashMap<u8, FxHashMap<u8, Box<[Option<RoutingTag>; method::MAX_METHODS]>>>,
    snoops: Vec<RoutingTag>,
}

/// Process-wide (per queue pair) registry of MAD clients: hands every send
///  and receive completion to exactly one [MadService].
pub struct MadDispatcher {
    transport: Arc<dyn MadTransport>,
    config: Arc<MadConfig>,
    buffer_pool: Arc<MadBufferPool>,
    tables: Mutex<DispatchTables>,
}

impl MadDispatcher {
    pub fn new(transport: Arc<dyn MadTransport>, config: MadConfig) -> anyhow::Result<MadDispatcher> {
        config.validate()?;
        let config = Arc::new(config);

        Ok(MadDispatcher {
            transport,
            buffer_pool: Arc::new(MadBufferPool::new(MAD_BLOCK_SIZE, config.buffer_pool_size)),
            config,
            tables: Mutex::new(DispatchTables::default()),
        })
    }

    /// Registers a client, claiming its unsolicited (version, class, method)
    ///  slots atomically: a single conflicting method fails the whole
    ///  registration with no partial claims left behind.
    pub fn register(&self, spec: RegistrationSpec) -> Result<Arc<MadService>, RegisterError> {
        if let Some(mask) = &spec.method_mask {
            if mask.is_empty() {
                return Err(RegisterError::EmptyMethodMask);
            }
            if mask.iter().any(|m| m >= method::MAX_METHODS) {
                return Err(RegisterError::InvalidMethodMask);
            }
        }

        let mut tables = self.tables.lock().unwrap();

        if let Some(mask) = &spec.method_mask {
            let claimed = tables.unsolicited
                .get(&spec.class_version)
                .and_then(|by_class| by_class.get(&spec.mgmt_class));
            if let Some(methods) = claimed {
                for m in mask.iter() {
                    if methods[m].is_some() {
                        return Err(RegisterError::MethodInUse {
                            version: spec.class_version,
                            class: spec.mgmt_class,
                            method: m.prechecked_cast(),
                        });
                    }
                }
            }
        }

        let slot_idx = tables.slots.iter().position(|s| s.is_none())
            .unwrap_or_else(|| {
                tables.slots.push(None);
                tables.slots.len() - 1
            });
        let tag = RoutingTag::from_raw((slot_idx + 1).prechecked_cast());

        let service = Arc::new(MadService::new(
            tag,
            spec.snoop,
            spec.client,
            self.transport.clone(),
            self.config.clone(),
            self.buffer_pool.clone(),
        ));

        if let Some(mask) = &spec.method_mask {
            let methods = tables.unsolicited
                .entry(spec.class_version).or_default()
                .entry(spec.mgmt_class).or_insert_with(|| Box::new([None; method::MAX_METHODS]));
            for m in mask.iter() {
                methods[m] = Some(tag);
            }
        }
        if spec.snoop {
            tables.snoops.push(tag);
        }

        tables.slots[slot_idx] = Some(Arc::new(Registration {
            tag,
            mgmt_class: spec.mgmt_class,
            class_version: spec.class_version,
            method_mask: spec.method_mask,
            deregistered: AtomicBool::new(false),
            service: service.clone(),
        }));

        debug!("registered client as {}", tag);
        Ok(service)
    }

    /// Deregisters a client: its unsolicited slots are released immediately,
    ///  its service is drained, and only then is the routing tag reclaimed.
    pub async fn deregister(&self, tag: RoutingTag) {
        let registration = {
            let mut tables = self.tables.lock().unwrap();
            let Some(registration) = Self::live_slot(&tables, tag) else {
                debug!("deregister for unknown tag {}", tag);
                return;
            };

            registration.deregistered.store(true, Ordering::SeqCst);

            if let Some(mask) = &registration.method_mask {
                if let Some(methods) = tables.unsolicited
                    .get_mut(&registration.class_version)
                    .and_then(|by_class| by_class.get_mut(&registration.mgmt_class))
                {
                    for m in mask.iter() {
                        if methods[m] == Some(tag) {
                            methods[m] = None;
                        }
                    }
                }
            }
            tables.snoops.retain(|&t| t != tag);

            registration
        };

        registration.service.shutdown().await;

        let mut tables = self.tables.lock().unwrap();
        let slot_idx: usize = tag.to_raw().safe_cast();
        tables.slots[slot_idx - 1] = None;
        debug!("deregistered {}", tag);
    }

    /// Routes one hardware send completion to the service that submitted the
    ///  segment, found through the routing half of the completed tid.
    pub async fn route_send_completion(&self, completion: SendCompletion) {
        let tag = completion.tid.routing_tag();

        let service = {
            let tables = self.tables.lock().unwrap();
            Self::slot(&tables, tag).map(|r| r.service.clone())
        };

        match service {
            Some(service) => service.process_send_completion(completion).await,
            None => {
                // e.g. the echo of an internally generated ACK, whose tid
                //  carries the remote sender's routing half
                trace!("send completion with unroutable tag {}: dropping", tag);
            }
        }
    }

    /// Routes one inbound MAD: snoopers first, then either by routing tag
    ///  (a response to a locally originated send) or by the (version, class,
    ///  method) table. `NotFound` leaves the message with the caller.
    pub async fn route_receive_completion(&self, mad: RecvMad) -> Result<(), RouteError> {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "mad_received", ?correlation_id);
        let _entered = span.enter();

        let header = MadHeader::deser(&mut &mad.data[..])
            .map_err(RouteError::Malformed)?;

        let snoops = {
            let tables = self.tables.lock().unwrap();
            tables.snoops.iter()
                .filter_map(|&t| Self::live_slot(&tables, t))
                .map(|r| r.service.clone())
                .collect::<Vec<_>>()
        };
        for snoop in snoops {
            snoop.process_receive(mad.clone()).instrument(Span::current()).await;
        }

        let tag = header.tid.routing_tag();
        let correlated = (header.is_response() || Self::is_rmpp_control(&mad.data))
            && header.mgmt_class != mgmt_class::CM
            && !tag.is_none();

        let service = if correlated {
            let tables = self.tables.lock().unwrap();
            Self::live_slot(&tables, tag).map(|r| r.service.clone())
        }
        else {
            let tables = self.tables.lock().unwrap();
            tables.unsolicited
                .get(&header.class_version)
                .and_then(|by_class| by_class.get(&header.mgmt_class))
                .and_then(|methods| {
                    let idx: usize = (header.method & !method::RESPONSE_BIT).safe_cast();
                    methods[idx]
                })
                .and_then(|t| Self::live_slot(&tables, t))
                .map(|r| r.service.clone())
        };

        match service {
            Some(service) => {
                service.process_receive(mad).instrument(Span::current()).await;
                Ok(())
            }
            None => {
                trace!("no registration for MAD from {} (class 0x{:02x} method 0x{:02x})",
                    mad.remote, header.mgmt_class, header.method);
                Err(RouteError::NotFound)
            }
        }
    }

    fn slot(tables: &DispatchTables, tag: RoutingTag) -> Option<&Arc<Registration>> {
        if tag.is_none() {
            return None;
        }
        let slot_idx: usize = tag.to_raw().safe_cast();
        tables.slots.get(slot_idx - 1)?.as_ref()
    }

    fn live_slot(tables: &DispatchTables, tag: RoutingTag) -> Option<Arc<Registration>> {
        Self::slot(tables, tag)
            .filter(|r| !r.deregistered.load(Ordering::SeqCst))
            .cloned()
    }

    /// An engine-level RMPP control segment (ACK, STOP, ABORT) is correlated
    ///  like a response even though its method may not carry the response bit.
    fn is_rmpp_control(data: &[u8]) -> bool {
        if data.len() < RmppHeader::OFFSET + RmppHeader::SERIALIZED_LEN {
            return false;
        }
        let area = &data[RmppHeader::OFFSET..];
        area[0] == RmppHeader::VERSION_1
            && area[2] & RmppFlags::ACTIVE.bits() != 0
            && matches!(RmppType::try_from(area[1]), Ok(RmppType::Ack | RmppType::Stop | RmppType::Abort))
    }
}
