//! Rendezvous broker
//!
//! Owns every piece of shared state (registry, group index, inactivity
//! timers, admission limiter) and implements the operations sessions drive:
//! admission, pairing, relay, disposal and teardown.
//!
//! Locking: each store guards itself. Pairing locks the two endpoints'
//! membership slots in token order and may then lock the group; disposal
//! never holds an endpoint lock while taking a group lock or the reverse.

use std::net::IpAddr;
use std::sync::{Arc, Weak};

use parking_lot::MutexGuard;
use tracing::{debug, error, info, warn};

use linkshare_core::token::normalize_token;
use linkshare_core::{Config, ConfigError, SessionConfig, TokenGenerator};

use crate::connection::Connection;
use crate::error::{AdmissionError, ProtocolError};
use crate::group::{GroupId, GroupIndex};
use crate::limiter::{AdmissionLimiter, LimiterConfig, LimiterStats};
use crate::messages::ServerMessage;
use crate::registry::{Endpoint, Registry};
use crate::supervisor::InactivitySupervisor;

/// Result of a pairing request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairOutcome {
    /// A new group was formed with the target
    Created(GroupId),
    /// The caller joined the target's existing group
    Joined(GroupId),
    /// Caller and target already share this group
    Rejoined(GroupId),
    /// The caller already belongs to a different group
    AlreadyPaired(GroupId),
    /// The caller asked to pair with itself
    SelfPair,
    /// No live connection holds the target token
    NotFound,
    /// The target went away while the group was forming
    TargetLost,
}

/// Counters for monitoring
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections: usize,
    pub groups: usize,
    pub timers: usize,
    pub limiter: LimiterStats,
}

/// Shared state for every session on this server
pub struct Broker {
    registry: Registry,
    groups: GroupIndex,
    supervisor: InactivitySupervisor,
    limiter: AdmissionLimiter,
    tokens: TokenGenerator,
    token_attempts: usize,
}

impl Broker {
    /// Build a broker from a full configuration, rejecting invalid settings
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::with_limiter(
            &config.session,
            AdmissionLimiter::with_config(LimiterConfig::from(&config.limits)),
        )
    }

    /// Build a broker around an existing limiter
    pub fn with_limiter(
        session: &SessionConfig,
        limiter: AdmissionLimiter,
    ) -> Result<Self, ConfigError> {
        let tokens = TokenGenerator::new(session.token_length, &session.token_alphabet)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            registry: Registry::new(),
            groups: GroupIndex::new(),
            supervisor: InactivitySupervisor::new(session.inactivity_timeout()),
            limiter,
            tokens,
            token_attempts: session.token_attempts,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn groups(&self) -> &GroupIndex {
        &self.groups
    }

    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    pub fn supervisor(&self) -> &InactivitySupervisor {
        &self.supervisor
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections: self.registry.len(),
            groups: self.groups.len(),
            timers: self.supervisor.pending(),
            limiter: self.limiter.stats(),
        }
    }

    /// Gate a new connection by origin, then issue it a unique token
    pub fn admit(
        &self,
        origin: Option<IpAddr>,
        connection: Connection,
    ) -> Result<Arc<Endpoint>, AdmissionError> {
        let origin = origin.ok_or(AdmissionError::OriginUnknown)?;
        if !self.limiter.hit(origin) {
            return Err(AdmissionError::RateLimited);
        }
        self.register(connection)
    }

    /// Issue a token and register the connection under it, retrying on
    /// collisions a bounded number of times
    pub fn register(&self, connection: Connection) -> Result<Arc<Endpoint>, AdmissionError> {
        for attempt in 1..=self.token_attempts {
            let token = self.tokens.generate()?;
            let endpoint = Arc::new(Endpoint::new(token, connection.clone()));

            if self.registry.insert(Arc::clone(&endpoint)) {
                info!("Generated token: {}", endpoint.token());
                return Ok(endpoint);
            }
            debug!(
                "Token {} already live (attempt {}/{})",
                endpoint.token(),
                attempt,
                self.token_attempts
            );
        }

        error!("Failed to generate token after {} attempts", self.token_attempts);
        Err(AdmissionError::TokenSpaceExhausted {
            attempts: self.token_attempts,
        })
    }

    /// Restart the inactivity deadline for `endpoint`
    pub fn touch(self: &Arc<Self>, endpoint: &Arc<Endpoint>) {
        let broker: Weak<Broker> = Arc::downgrade(self);
        let target: Weak<Endpoint> = Arc::downgrade(endpoint);

        self.supervisor.arm(endpoint.token(), move || {
            if let (Some(broker), Some(endpoint)) = (broker.upgrade(), target.upgrade()) {
                broker.expire(&endpoint);
            }
        });
    }

    /// Inactivity deadline passed: drop the endpoint's pairing, or just its
    /// connection when unpaired
    pub fn expire(&self, endpoint: &Arc<Endpoint>) {
        if endpoint.is_torn_down() {
            return;
        }
        info!(
            "Closing {} after {:?} of inactivity",
            endpoint.token(),
            self.supervisor.timeout()
        );
        if endpoint.group().is_some() {
            self.dispose(endpoint);
        } else {
            endpoint.connection().close(Some("inactivity timeout"));
        }
    }

    /// Pair `caller` with the connection holding `target`
    pub fn pair(&self, caller: &Arc<Endpoint>, target: &str) -> PairOutcome {
        let wanted = normalize_token(target);

        if wanted == caller.token() {
            warn!("{} tried to pair with itself", caller.token());
            return PairOutcome::SelfPair;
        }

        match self.registry.lookup(&wanted) {
            Some(other) if !other.is_torn_down() => self.pair_with(caller, &other, target),
            _ => {
                self.report_not_found(caller, target);
                PairOutcome::NotFound
            }
        }
    }

    fn report_not_found(&self, caller: &Endpoint, target: &str) {
        warn!("{} sent unknown target {}", caller.token(), target);
        if let Err(e) = caller.send(ServerMessage::CodeNotFound {
            code: target.to_string(),
        }) {
            debug!("Could not report missing target to {}: {}", caller.token(), e);
        }
    }

    /// Pair with an endpoint already looked up. The target may start its
    /// teardown at any point before its membership is locked.
    pub(crate) fn pair_with(
        &self,
        caller: &Arc<Endpoint>,
        other: &Arc<Endpoint>,
        target: &str,
    ) -> PairOutcome {
        let outcome = {
            let (mut mine, mut theirs) = lock_pair(caller, other);

            // Teardown flags the endpoint before taking this lock to dispose it
            if other.is_torn_down() {
                PairOutcome::TargetLost
            } else if let Some(current) = *mine {
                if *theirs == Some(current) {
                    PairOutcome::Rejoined(current)
                } else {
                    PairOutcome::AlreadyPaired(current)
                }
            } else {
                let existing = (*theirs).and_then(|id| self.groups.get(id));
                match existing {
                    Some(group) if group.add(Arc::clone(caller)) => {
                        *mine = Some(group.id());
                        PairOutcome::Joined(group.id())
                    }
                    _ => {
                        let group = self.groups.create();
                        group.add(Arc::clone(caller));
                        group.add(Arc::clone(other));
                        *mine = Some(group.id());
                        *theirs = Some(group.id());
                        self.groups.publish(Arc::clone(&group));
                        PairOutcome::Created(group.id())
                    }
                }
            }
        };

        match outcome {
            PairOutcome::Created(id) => {
                info!("{} paired with {} in {}", caller.token(), other.token(), id);
                if other.send(ServerMessage::Connected).is_err() {
                    debug!("{} vanished while pairing", other.token());
                    if let Some(group) = self.groups.get(id) {
                        self.groups.dispose(&group, other);
                    }
                    return PairOutcome::TargetLost;
                }
                self.acknowledge(caller);
            }
            PairOutcome::TargetLost => {
                debug!("{} is shutting down; cannot pair", other.token());
                self.report_not_found(caller, target);
            }
            PairOutcome::Joined(id) => {
                info!("{} joined {} via {}", caller.token(), id, other.token());
                self.acknowledge(caller);
            }
            PairOutcome::Rejoined(_) => self.acknowledge(caller),
            PairOutcome::AlreadyPaired(id) => {
                warn!(
                    "{} is already in {}; ignoring pair with {}",
                    caller.token(),
                    id,
                    other.token()
                );
            }
            _ => {}
        }

        outcome
    }

    fn acknowledge(&self, caller: &Arc<Endpoint>) {
        if caller.send(ServerMessage::Connected).is_err() {
            self.dispose(caller);
        }
    }

    /// Relay `content` from `sender` to the rest of its group
    pub fn relay(
        &self,
        sender: &Arc<Endpoint>,
        content: serde_json::Value,
    ) -> Result<usize, ProtocolError> {
        let group = sender
            .group()
            .and_then(|id| self.groups.get(id))
            .ok_or(ProtocolError::NotPaired)?;

        let msg = ServerMessage::Content {
            content,
            sender: sender.token().to_string(),
        };
        Ok(self.groups.broadcast(&group, sender.token(), &msg))
    }

    /// Remove `endpoint` from its group (cascading per group rules) and
    /// close it. No-op for unpaired endpoints.
    pub fn dispose(&self, endpoint: &Arc<Endpoint>) {
        let Some(id) = endpoint.group() else {
            return;
        };
        match self.groups.get(id) {
            Some(group) => self.groups.dispose(&group, endpoint),
            None => {
                if endpoint.leave(id) {
                    endpoint.disconnect();
                }
            }
        }
    }

    /// Final cleanup for a connection. Runs once; later calls return `false`.
    pub fn teardown(&self, endpoint: &Arc<Endpoint>) -> bool {
        if !endpoint.begin_teardown() {
            return false;
        }

        self.supervisor.cancel(endpoint.token());
        self.dispose(endpoint);
        endpoint.connection().close(None);
        if !self.registry.remove(endpoint) {
            debug!("{} was not registered", endpoint.token());
        }

        info!("Client {} disconnected", endpoint.token());
        true
    }
}

type Membership<'a> = MutexGuard<'a, Option<GroupId>>;

/// Lock two endpoints' membership slots in token order
fn lock_pair<'a>(caller: &'a Endpoint, other: &'a Endpoint) -> (Membership<'a>, Membership<'a>) {
    if caller.token() < other.token() {
        let mine = caller.membership();
        let theirs = other.membership();
        (mine, theirs)
    } else {
        let theirs = other.membership();
        let mine = caller.membership();
        (mine, theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Outbox, Outgoing};
    use crate::group::GroupState;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn broker_with(session: SessionConfig) -> Arc<Broker> {
        Arc::new(Broker::with_limiter(&session, AdmissionLimiter::new()).unwrap())
    }

    fn broker() -> Arc<Broker> {
        broker_with(SessionConfig::default())
    }

    fn origin() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn connect(broker: &Broker) -> (Arc<Endpoint>, Outbox) {
        let (conn, outbox) = Connection::channel(16);
        (broker.register(conn).unwrap(), outbox)
    }

    async fn expect(outbox: &mut Outbox, msg: ServerMessage) {
        assert_eq!(outbox.next().await, Outgoing::Message(msg));
    }

    #[test]
    fn test_register_issues_well_formed_tokens() {
        let broker = broker();
        let generator = TokenGenerator::default();
        for _ in 0..20 {
            let (ep, _outbox) = connect(&broker);
            assert!(generator.is_well_formed(ep.token()));
        }
        assert_eq!(broker.registry().len(), 20);
    }

    #[test]
    fn test_rejects_empty_alphabet() {
        let mut config = Config::default();
        config.session.token_alphabet = String::new();
        assert!(matches!(Broker::new(&config), Err(ConfigError::Invalid(_))));

        let session = SessionConfig {
            token_alphabet: String::new(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            Broker::with_limiter(&session, AdmissionLimiter::new()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_token_space_exhaustion() {
        let broker = broker_with(SessionConfig {
            token_length: 1,
            token_alphabet: "A".into(),
            token_attempts: 3,
            ..SessionConfig::default()
        });

        let (first, _o1) = connect(&broker);
        assert_eq!(first.token(), "A");

        let (conn, _o2) = Connection::channel(4);
        assert_eq!(
            broker.register(conn).unwrap_err(),
            AdmissionError::TokenSpaceExhausted { attempts: 3 }
        );
        assert_eq!(broker.registry().len(), 1);

        // The token frees up once its owner is gone
        broker.teardown(&first);
        let (again, _o3) = connect(&broker);
        assert_eq!(again.token(), "A");
    }

    #[test]
    fn test_admit_requires_origin() {
        let broker = broker();
        let (conn, _outbox) = Connection::channel(4);
        assert_eq!(
            broker.admit(None, conn).unwrap_err(),
            AdmissionError::OriginUnknown
        );
        assert!(broker.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_rate_limited() {
        let limiter = AdmissionLimiter::with_config(LimiterConfig {
            max_hits: 2,
            window: Duration::from_secs(60),
        });
        let broker = Broker::with_limiter(&SessionConfig::default(), limiter).unwrap();

        for _ in 0..2 {
            let (conn, _outbox) = Connection::channel(4);
            assert!(broker.admit(origin(), conn).is_ok());
        }
        let (conn, _outbox) = Connection::channel(4);
        assert_eq!(
            broker.admit(origin(), conn).unwrap_err(),
            AdmissionError::RateLimited
        );
    }

    #[tokio::test]
    async fn test_pair_is_symmetric() {
        let broker = broker();
        let (a, mut oa) = connect(&broker);
        let (b, mut ob) = connect(&broker);

        let outcome = broker.pair(&b, a.token());
        let PairOutcome::Created(id) = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };

        expect(&mut oa, ServerMessage::Connected).await;
        expect(&mut ob, ServerMessage::Connected).await;
        assert_eq!(a.group(), Some(id));
        assert_eq!(b.group(), Some(id));
        assert_eq!(broker.groups().get(id).unwrap().state(), GroupState::Active);
    }

    #[test]
    fn test_pair_normalizes_target() {
        let broker = broker();
        let (a, _oa) = connect(&broker);
        let (b, _ob) = connect(&broker);

        let typed = a.token().to_ascii_lowercase();
        assert!(matches!(broker.pair(&b, &typed), PairOutcome::Created(_)));
    }

    #[tokio::test]
    async fn test_self_pair_is_noop() {
        let broker = broker();
        let (a, mut oa) = connect(&broker);

        assert_eq!(broker.pair(&a, a.token()), PairOutcome::SelfPair);
        assert_eq!(a.group(), None);
        assert!(broker.groups().is_empty());

        a.connection().close(None);
        assert_eq!(oa.next().await, Outgoing::Close(None));
    }

    #[tokio::test]
    async fn test_unknown_target_reported() {
        let broker = broker();
        let (a, mut oa) = connect(&broker);

        assert_eq!(broker.pair(&a, "nope!"), PairOutcome::NotFound);
        expect(&mut oa, ServerMessage::CodeNotFound { code: "nope!".into() }).await;
        assert!(!a.connection().is_closed());
        assert_eq!(a.group(), None);
    }

    #[tokio::test]
    async fn test_join_existing_group() {
        let broker = broker();
        let (a, _oa) = connect(&broker);
        let (b, _ob) = connect(&broker);
        let (c, mut oc) = connect(&broker);

        let PairOutcome::Created(id) = broker.pair(&b, a.token()) else {
            panic!("expected a new group");
        };
        assert_eq!(broker.pair(&c, a.token()), PairOutcome::Joined(id));
        expect(&mut oc, ServerMessage::Connected).await;
        assert_eq!(broker.groups().get(id).unwrap().member_count(), 3);
        assert_eq!(broker.groups().len(), 1);
    }

    #[test]
    fn test_repair_and_already_paired() {
        let broker = broker();
        let (a, _oa) = connect(&broker);
        let (b, _ob) = connect(&broker);
        let (c, _oc) = connect(&broker);
        let (d, _od) = connect(&broker);

        let PairOutcome::Created(ab) = broker.pair(&b, a.token()) else {
            panic!("expected a new group");
        };
        assert_eq!(broker.pair(&a, b.token()), PairOutcome::Rejoined(ab));

        let PairOutcome::Created(cd) = broker.pair(&c, d.token()) else {
            panic!("expected a new group");
        };
        assert_eq!(broker.pair(&a, c.token()), PairOutcome::AlreadyPaired(ab));
        assert_eq!(a.group(), Some(ab));
        assert_eq!(broker.groups().get(cd).unwrap().member_count(), 2);
    }

    #[tokio::test]
    async fn test_relay_tags_sender_and_skips_it() {
        let broker = broker();
        let (a, mut oa) = connect(&broker);
        let (b, mut ob) = connect(&broker);
        broker.pair(&b, a.token());
        expect(&mut oa, ServerMessage::Connected).await;
        expect(&mut ob, ServerMessage::Connected).await;

        assert_eq!(broker.relay(&a, json!("hello")), Ok(1));
        expect(
            &mut ob,
            ServerMessage::Content {
                content: json!("hello"),
                sender: a.token().to_string(),
            },
        )
        .await;

        a.connection().close(None);
        assert_eq!(oa.next().await, Outgoing::Close(None));
    }

    #[test]
    fn test_relay_unpaired_is_violation() {
        let broker = broker();
        let (a, _oa) = connect(&broker);
        assert_eq!(broker.relay(&a, json!(1)), Err(ProtocolError::NotPaired));
    }

    #[tokio::test]
    async fn test_teardown_cascades_and_is_idempotent() {
        let broker = broker();
        let (a, _oa) = connect(&broker);
        let (b, mut ob) = connect(&broker);
        let PairOutcome::Created(id) = broker.pair(&b, a.token()) else {
            panic!("expected a new group");
        };
        expect(&mut ob, ServerMessage::Connected).await;

        assert!(broker.teardown(&a));
        assert!(!broker.teardown(&a));

        assert!(broker.groups().get(id).is_none());
        assert!(!broker.registry().contains(a.token()));
        // b is closed by the cascade; its own session removes it later
        expect(&mut ob, ServerMessage::Disconnected).await;
        assert_eq!(ob.next().await, Outgoing::Close(None));
        assert!(broker.registry().contains(b.token()));

        assert!(broker.teardown(&b));
        assert!(broker.registry().is_empty());
    }

    #[tokio::test]
    async fn test_pair_with_dying_target() {
        let broker = broker();
        let (a, _oa) = connect(&broker);
        let (b, _ob) = connect(&broker);

        a.connection().close(None);
        assert_eq!(broker.pair(&b, a.token()), PairOutcome::TargetLost);
        assert!(broker.groups().is_empty());
        assert!(b.connection().is_closed());
    }

    #[tokio::test]
    async fn test_target_torn_down_after_lookup() {
        let broker = broker();
        let (a, _oa) = connect(&broker);
        let (b, mut ob) = connect(&broker);

        // a starts tearing down between b's lookup and the membership lock
        let other = broker.registry().lookup(a.token()).unwrap();
        assert!(a.begin_teardown());

        assert_eq!(
            broker.pair_with(&b, &other, a.token()),
            PairOutcome::TargetLost
        );
        expect(
            &mut ob,
            ServerMessage::CodeNotFound {
                code: a.token().to_string(),
            },
        )
        .await;
        assert!(broker.groups().is_empty());
        assert_eq!(a.group(), None);
        assert_eq!(b.group(), None);
        assert!(!b.connection().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_closes_unpaired() {
        let broker = broker_with(SessionConfig {
            inactivity_timeout_secs: 30,
            ..SessionConfig::default()
        });
        let (a, mut oa) = connect(&broker);

        broker.touch(&a);
        tokio::time::sleep(Duration::from_secs(29)).await;
        broker.touch(&a);
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(!a.connection().is_closed());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(a.connection().is_closed());
        assert_eq!(
            oa.next().await,
            Outgoing::Close(Some("inactivity timeout".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_dissolves_pairing() {
        let broker = broker_with(SessionConfig {
            inactivity_timeout_secs: 30,
            ..SessionConfig::default()
        });
        let (a, _oa) = connect(&broker);
        let (b, _ob) = connect(&broker);
        broker.pair(&b, a.token());

        broker.touch(&a);
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(a.connection().is_closed());
        assert!(b.connection().is_closed());
        assert!(broker.groups().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_expiry_after_teardown() {
        let broker = broker_with(SessionConfig {
            inactivity_timeout_secs: 30,
            ..SessionConfig::default()
        });
        let (a, _oa) = connect(&broker);
        broker.touch(&a);
        broker.teardown(&a);
        assert_eq!(broker.stats().timers, 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(broker.stats().connections, 0);
    }
}
