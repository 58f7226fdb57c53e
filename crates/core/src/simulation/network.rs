//! Simulated network layer with deterministic packet routing.
//!
//! The [`Cluster`] owns every machine's port table, the links between
//! machines and the outage windows. Sending a packet turns into a delivery
//! plan: zero, one or two delays after which the packet reaches the
//! destination's port table through the scheduler.

use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
    time::Duration,
};

use super::{
    fault::{NetworkProfile, Outage},
    rng::SimulationRng,
    time::duration_to_nanos,
};
use crate::transport::{ConnIds, ConnKey, Effects, Endpoint, Packet, PortTable};

/// Statistics about the simulated network.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NetworkStats {
    /// Total packets handed to the router
    pub packets_sent: u64,
    /// Total packets that reached a destination machine
    pub packets_delivered: u64,
    /// Extra copies injected by duplication
    pub packets_duplicated: u64,
    /// Dropped by random loss
    pub dropped_loss: u64,
    /// Dropped by a per-flag filter
    pub dropped_filtered: u64,
    /// No link between the two machines
    pub dropped_no_route: u64,
    /// Destination inside an outage window
    pub dropped_outage: u64,
    /// Source or destination machine stopped
    pub dropped_down: u64,
    /// Total latency added (nanoseconds)
    pub total_latency_nanos: u64,
}

impl NetworkStats {
    pub fn total_dropped(&self) -> u64 {
        self.dropped_loss
            + self.dropped_filtered
            + self.dropped_no_route
            + self.dropped_outage
            + self.dropped_down
    }

    /// Returns average latency per planned delivery.
    pub fn average_latency(&self) -> Duration {
        let deliveries = (self.packets_sent + self.packets_duplicated).saturating_sub(self.total_dropped());
        if deliveries == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_latency_nanos / deliveries)
        }
    }
}

impl fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} delivered={} duplicated={} dropped={} (loss={} filtered={} no_route={} outage={} down={}) avg_latency={:?}",
            self.packets_sent,
            self.packets_delivered,
            self.packets_duplicated,
            self.total_dropped(),
            self.dropped_loss,
            self.dropped_filtered,
            self.dropped_no_route,
            self.dropped_outage,
            self.dropped_down,
            self.average_latency()
        )
    }
}

pub(crate) struct Machine {
    pub up: bool,
    pub ports: PortTable,
}

/// Bidirectional link between two machines.
struct Link {
    profile: NetworkProfile,
    /// Packets sent so far, per source machine
    sent: BTreeMap<Arc<str>, u64>,
}

/// What the router decided for one packet.
#[derive(Debug, Default)]
pub(crate) struct Route {
    /// Delay of each copy to deliver; empty when the packet was dropped
    pub deliveries: Vec<Duration>,
    /// Set when the link records its packets in the event log
    pub note: Option<String>,
}

/// Topology and routing state of a run.
pub(crate) struct Cluster {
    machines: BTreeMap<Arc<str>, Machine>,
    /// Keyed by the two machine names in sorted order
    links: BTreeMap<(Arc<str>, Arc<str>), Link>,
    outages: Vec<Outage>,
    stats: NetworkStats,
    ids: ConnIds,
    default_latency: Duration,
    trace_network: bool,
}

fn link_key(a: &str, b: &str) -> (Arc<str>, Arc<str>) {
    if a <= b {
        (a.into(), b.into())
    } else {
        (b.into(), a.into())
    }
}

impl Cluster {
    pub fn new(default_latency: Duration, trace_network: bool) -> Self {
        Self {
            machines: BTreeMap::new(),
            links: BTreeMap::new(),
            outages: Vec::new(),
            stats: NetworkStats::default(),
            ids: ConnIds::default(),
            default_latency,
            trace_network,
        }
    }

    /// Registers a machine if it does not exist yet.
    pub fn add_machine(&mut self, name: &str) -> &mut Machine {
        let ids = self.ids.clone();
        self.machines
            .entry(Arc::from(name))
            .or_insert_with_key(|name| Machine {
                up: true,
                ports: PortTable::new(name.clone(), ids),
            })
    }

    pub fn machine_mut(&mut self, name: &str) -> Option<&mut Machine> {
        self.machines.get_mut(name)
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.machines.get(name).is_some_and(|m| m.up)
    }

    /// Takes a machine offline and forgets all its sockets.
    pub fn shut_down(&mut self, name: &str) {
        if let Some(machine) = self.machines.get_mut(name) {
            machine.up = false;
            machine.ports.reset();
        }
    }

    /// Takes every machine offline, as at the end of a run.
    pub fn shut_down_all(&mut self) {
        for machine in self.machines.values_mut() {
            machine.up = false;
            machine.ports.reset();
        }
    }

    pub fn start_up(&mut self, name: &str) {
        self.add_machine(name).up = true;
    }

    /// Connects two machines. Links are bidirectional; linking the same
    /// pair again replaces the profile.
    pub fn link(&mut self, a: &str, b: &str, profile: NetworkProfile) {
        self.add_machine(a);
        self.add_machine(b);
        self.links.insert(
            link_key(a, b),
            Link {
                profile,
                sent: BTreeMap::new(),
            },
        );
    }

    pub fn add_outage(&mut self, outage: Outage) {
        tracing::debug!(machine = %outage.machine, end = ?outage.end_time, "outage declared");
        self.outages.push(outage);
    }

    fn in_outage(&mut self, machine: &str, now: u64) -> bool {
        self.outages.retain(|o| !o.has_ended(now));
        self.outages.iter().any(|o| o.blocks(machine, now))
    }

    /// True if a SYN sent now from `from` could reach a socket listening
    /// on `remote`.
    pub fn is_listening(&self, from: &str, remote: &Endpoint, now: u64) -> bool {
        let dst = remote.machine();
        let linked = from == dst || self.links.contains_key(&link_key(from, dst));
        linked
            && self.is_up(dst)
            && !self.outages.iter().any(|o| o.blocks(dst, now))
            && self
                .machines
                .get(dst)
                .is_some_and(|m| m.ports.is_listening(remote.port()))
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Decides what happens to a packet leaving its source.
    pub fn route(&mut self, packet: &Packet, now: u64, rng: &SimulationRng) -> Route {
        self.stats.packets_sent += 1;
        let src = packet.source.machine();
        let dst = packet.destination.machine();

        let default_profile;
        let (profile, index) = if src == dst {
            default_profile = NetworkProfile::default();
            (&default_profile, 0)
        } else {
            match self.links.get_mut(&link_key(src, dst)) {
                Some(link) => {
                    let counter = link.sent.entry(Arc::from(src)).or_insert(0);
                    let index = *counter;
                    *counter += 1;
                    (&link.profile, index)
                }
                None => {
                    self.stats.dropped_no_route += 1;
                    tracing::debug!(packet = %packet.summary(), "no route to host, packet dropped");
                    return Route {
                        deliveries: Vec::new(),
                        note: self
                            .trace_network
                            .then(|| format!("{} dropped: no route", packet.summary())),
                    };
                }
            }
        };
        let log = profile.log_packets || self.trace_network;
        let note = |outcome: &str| log.then(|| format!("{} {outcome}", packet.summary()));

        let reachable = |name: &str| self.machines.get(name).is_some_and(|m| m.up);
        if !reachable(src) || !reachable(dst) {
            self.stats.dropped_down += 1;
            return Route {
                deliveries: Vec::new(),
                note: note("dropped: machine down"),
            };
        }
        if self.outages.iter().any(|o| o.blocks(dst, now)) {
            self.stats.dropped_outage += 1;
            return Route {
                deliveries: Vec::new(),
                note: note("dropped: outage"),
            };
        }
        if profile.filters(packet.flag) {
            self.stats.dropped_filtered += 1;
            return Route {
                deliveries: Vec::new(),
                note: note("dropped: filtered"),
            };
        }
        if profile.should_drop(rng) {
            self.stats.dropped_loss += 1;
            return Route {
                deliveries: Vec::new(),
                note: note("dropped: lost"),
            };
        }

        let mut deliveries = vec![profile.latency.sample(index, self.default_latency, rng)];
        if profile.should_duplicate(rng) {
            self.stats.packets_duplicated += 1;
            deliveries.push(profile.latency.sample(index, self.default_latency, rng));
        }
        for latency in &deliveries {
            self.stats.total_latency_nanos += duration_to_nanos(*latency);
        }

        if log {
            tracing::trace!(packet = %packet.summary(), ?deliveries, "packet scheduled for delivery");
        }
        let note = match deliveries.as_slice() {
            [latency] => note(&format!("in {latency:?}")),
            _ => note(&format!("in {deliveries:?} (duplicated)")),
        };
        Route { deliveries, note }
    }

    /// Hands an arrived packet to the destination's port table.
    pub fn deliver(&mut self, packet: Packet, now: u64, fx: &mut Effects) {
        let dst = packet.destination.machine().to_owned();
        if self.in_outage(&dst, now) {
            self.stats.dropped_outage += 1;
            tracing::trace!(packet = %packet.summary(), "arrived during outage, dropped");
            return;
        }
        match self.machines.get_mut(dst.as_str()) {
            Some(machine) if machine.up => {
                self.stats.packets_delivered += 1;
                machine.ports.receive(packet, fx);
            }
            _ => {
                self.stats.dropped_down += 1;
                tracing::trace!(packet = %packet.summary(), "destination down, dropped");
            }
        }
    }

    pub fn is_half_open(&self, key: &ConnKey) -> bool {
        self.machines
            .get(key.local.machine())
            .is_some_and(|m| m.ports.is_half_open(key))
    }

    pub fn expire_handshake(&mut self, key: &ConnKey, fx: &mut Effects) {
        if let Some(machine) = self.machines.get_mut(key.local.machine()) {
            machine.ports.expire_handshake(key, fx);
        }
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("machines", &self.machines.keys().collect::<Vec<_>>())
            .field("links", &self.links.keys().collect::<Vec<_>>())
            .field("outages", &self.outages)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Flag;

    fn packet(from: &str, to: &str) -> Packet {
        Packet::control(Endpoint::new(from, 49152), Endpoint::new(to, 80), Flag::Syn, 0)
    }

    fn cluster() -> Cluster {
        Cluster::new(Duration::from_millis(10), false)
    }

    #[test]
    fn test_no_link_means_no_route() {
        let mut cluster = cluster();
        cluster.add_machine("a");
        cluster.add_machine("b");
        let route = cluster.route(&packet("a", "b"), 0, &SimulationRng::new(1));
        assert!(route.deliveries.is_empty());
        assert_eq!(cluster.stats().dropped_no_route, 1);
    }

    #[test]
    fn test_links_are_bidirectional() {
        let mut cluster = cluster();
        cluster.link("a", "b", NetworkProfile::default());
        let rng = SimulationRng::new(1);
        assert_eq!(
            cluster.route(&packet("a", "b"), 0, &rng).deliveries,
            vec![Duration::from_millis(10)]
        );
        assert_eq!(
            cluster.route(&packet("b", "a"), 0, &rng).deliveries,
            vec![Duration::from_millis(10)]
        );
    }

    #[test]
    fn test_loopback_uses_default_profile() {
        let mut cluster = cluster();
        cluster.add_machine("a");
        let route = cluster.route(&packet("a", "a"), 0, &SimulationRng::new(1));
        assert_eq!(route.deliveries, vec![Duration::from_millis(10)]);
    }

    #[test]
    fn test_reverse_latency_counts_per_direction() {
        let mut cluster = cluster();
        cluster.link("a", "b", NetworkProfile::reversing());
        let rng = SimulationRng::new(1);

        let first = cluster.route(&packet("a", "b"), 0, &rng).deliveries[0];
        let reply = cluster.route(&packet("b", "a"), 0, &rng).deliveries[0];
        let second = cluster.route(&packet("a", "b"), 0, &rng).deliveries[0];
        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(reply, Duration::from_millis(100));
        assert_eq!(second, Duration::from_millis(90));
    }

    #[test]
    fn test_outage_drops_sends() {
        let mut cluster = cluster();
        cluster.link("a", "b", NetworkProfile::default());
        cluster.add_outage(Outage::new("b").with_duration(0, Duration::from_secs(1)));
        let rng = SimulationRng::new(1);

        assert!(cluster.route(&packet("a", "b"), 0, &rng).deliveries.is_empty());
        assert_eq!(cluster.stats().dropped_outage, 1);

        let after = duration_to_nanos(Duration::from_secs(2));
        assert_eq!(cluster.route(&packet("a", "b"), after, &rng).deliveries.len(), 1);
    }

    #[test]
    fn test_duplication_and_filters() {
        let mut cluster = cluster();
        cluster.link(
            "a",
            "b",
            NetworkProfile::builder()
                .duplicate_rate(1.0)
                .drop_flag(Flag::SynAck)
                .build(),
        );
        let rng = SimulationRng::new(1);

        assert_eq!(cluster.route(&packet("a", "b"), 0, &rng).deliveries.len(), 2);
        let synack = Packet::control(Endpoint::new("b", 80), Endpoint::new("a", 1), Flag::SynAck, 0);
        assert!(cluster.route(&synack, 0, &rng).deliveries.is_empty());
        assert_eq!(cluster.stats().packets_duplicated, 1);
        assert_eq!(cluster.stats().dropped_filtered, 1);
    }

    #[test]
    fn test_listening_needs_link_socket_and_live_host() {
        let mut cluster = cluster();
        cluster.add_machine("c");
        cluster.link("a", "b", NetworkProfile::default());
        let server = Endpoint::new("b", 80);
        assert!(!cluster.is_listening("a", &server, 0));

        cluster.machine_mut("b").unwrap().ports.bind(80, 8).unwrap();
        assert!(cluster.is_listening("a", &server, 0));
        assert!(!cluster.is_listening("c", &server, 0));

        cluster.add_outage(Outage::new("b").with_duration(0, Duration::from_secs(1)));
        assert!(!cluster.is_listening("a", &server, 0));

        cluster.shut_down("b");
        let later = duration_to_nanos(Duration::from_secs(2));
        assert!(!cluster.is_listening("a", &server, later));
    }

    #[test]
    fn test_down_machine_receives_nothing() {
        let mut cluster = cluster();
        cluster.link("a", "b", NetworkProfile::default());
        cluster.shut_down("b");
        let rng = SimulationRng::new(1);
        assert!(cluster.route(&packet("a", "b"), 0, &rng).deliveries.is_empty());
        assert_eq!(cluster.stats().dropped_down, 1);

        cluster.start_up("b");
        assert_eq!(cluster.route(&packet("a", "b"), 0, &rng).deliveries.len(), 1);
    }
}
