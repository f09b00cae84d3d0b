//! Property-based convergence tests for the text store.
//!
//! Replicas edit concurrently while their operations are in flight. In the
//! mesh tests every replica takes operations in its own arbitrary order,
//! with duplicates. The hub tests route everything through one authority
//! over ordered links, the way the server does, and compact while edits
//! are still travelling. Whatever happened, all replicas must render the
//! same text.

use proptest::prelude::*;
use proptest::sample::Index;
use std::collections::{BTreeMap, VecDeque};
use tandem_core::{safe_point, Operation, SiteId, TextStore, VectorClock};

const SITES: usize = 3;

#[derive(Clone, Debug)]
enum EditOp {
    Insert { pos_pct: f64, text: String },
    Delete { pos_pct: f64, len_pct: f64 },
    Format { pos_pct: f64, bold: bool },
}

fn arbitrary_edit_op() -> impl Strategy<Value = EditOp> {
    prop_oneof![
        3 => (0.0..=1.0f64, "[a-z]{1,6}")
            .prop_map(|(pos_pct, text)| EditOp::Insert { pos_pct, text }),
        2 => (0.0..=1.0f64, 0.0..=0.5f64)
            .prop_map(|(pos_pct, len_pct)| EditOp::Delete { pos_pct, len_pct }),
        1 => (0.0..=1.0f64, any::<bool>())
            .prop_map(|(pos_pct, bold)| EditOp::Format { pos_pct, bold }),
    ]
}

fn apply_edit(store: &mut TextStore, op: &EditOp) -> Vec<Operation> {
    let len = store.len();
    let at = |pct: f64| ((pct * len as f64) as usize).min(len);
    let applied = match op {
        EditOp::Insert { pos_pct, text } => store.insert_at(at(*pos_pct), text),
        EditOp::Delete { pos_pct, len_pct } => {
            if len == 0 {
                return Vec::new();
            }
            let start = at(*pos_pct).min(len - 1);
            let count = ((*len_pct * (len - start) as f64) as usize).clamp(1, len - start);
            store.delete_range(start..start + count)
        }
        EditOp::Format { pos_pct, bold } => {
            if len == 0 {
                return Vec::new();
            }
            let start = at(*pos_pct).min(len - 1);
            let attrs = BTreeMap::from([("bold".to_string(), bold.to_string())]);
            store.format_range(start..start + 1, attrs).map(|a| vec![a])
        }
    };
    applied
        .expect("local edits within bounds succeed")
        .into_iter()
        .map(|a| a.op)
        .collect()
}

fn assert_converged(stores: &[&TextStore]) -> Result<(), TestCaseError> {
    let text = stores[0].render();
    for store in stores {
        prop_assert_eq!(store.render(), text.clone());
        prop_assert_eq!(store.deferred_len(), 0);
        prop_assert_eq!(store.clock(), stores[0].clock());
    }
    Ok(())
}

// ─── mesh: every replica talks to every other, no ordering ───

#[derive(Clone, Debug)]
enum Step {
    Edit { site: usize, op: EditOp },
    /// `to` takes one arbitrary operation out of its inbox.
    Receive { to: usize, pick: Index },
    /// One already sent operation arrives at `to` again.
    Duplicate { to: usize, pick: Index },
}

fn arbitrary_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0..SITES, arbitrary_edit_op()).prop_map(|(site, op)| Step::Edit { site, op }),
        3 => (0..SITES, any::<Index>()).prop_map(|(to, pick)| Step::Receive { to, pick }),
        1 => (0..SITES, any::<Index>()).prop_map(|(to, pick)| Step::Duplicate { to, pick }),
    ]
}

/// Per-replica delivery orders for whatever is still in flight at the end.
fn arbitrary_orders() -> impl Strategy<Value = Vec<Vec<Index>>> {
    prop::collection::vec(prop::collection::vec(any::<Index>(), 1..16), SITES)
}

struct Mesh {
    stores: Vec<TextStore>,
    inboxes: Vec<Vec<Operation>>,
    sent: Vec<Operation>,
}

impl Mesh {
    fn new() -> Self {
        Self {
            stores: (0..SITES)
                .map(|i| TextStore::with_content(SiteId::from_u128(i as u128 + 1), "seed"))
                .collect(),
            inboxes: vec![Vec::new(); SITES],
            sent: Vec::new(),
        }
    }

    fn run(&mut self, steps: &[Step]) {
        for step in steps {
            match step {
                Step::Edit { site, op } => {
                    for op in apply_edit(&mut self.stores[*site], op) {
                        for (to, inbox) in self.inboxes.iter_mut().enumerate() {
                            if to != *site {
                                inbox.push(op.clone());
                            }
                        }
                        self.sent.push(op);
                    }
                }
                Step::Receive { to, pick } => {
                    let inbox = &mut self.inboxes[*to];
                    if !inbox.is_empty() {
                        let op = inbox.swap_remove(pick.index(inbox.len()));
                        self.stores[*to].apply_remote(op).expect("valid operation");
                    }
                }
                Step::Duplicate { to, pick } => {
                    if !self.sent.is_empty() {
                        let op = self.sent[pick.index(self.sent.len())].clone();
                        self.inboxes[*to].push(op);
                    }
                }
            }
        }
    }

    /// Deliver everything still in flight, each replica in its own order.
    fn drain(&mut self, orders: &[Vec<Index>]) {
        for (to, order) in orders.iter().enumerate() {
            let mut picks = order.iter().cycle();
            while !self.inboxes[to].is_empty() {
                let len = self.inboxes[to].len();
                let at = picks.next().map_or(0, |p| p.index(len));
                let op = self.inboxes[to].swap_remove(at);
                self.stores[to].apply_remote(op).expect("valid operation");
            }
        }
    }

    fn stores(&self) -> Vec<&TextStore> {
        self.stores.iter().collect()
    }
}

// ─── hub: clients talk only to one authority over ordered links ───

#[derive(Clone, Debug)]
enum HubStep {
    Edit { client: usize, op: EditOp },
    /// The hub takes the next message from `client`.
    Upload { client: usize },
    /// `client` takes the next message from the hub.
    Download { client: usize },
    /// `client` tells the hub how far it has got.
    Report { client: usize },
    /// The hub compacts and announces its safe point.
    Compact,
}

fn arbitrary_hub_step() -> impl Strategy<Value = HubStep> {
    prop_oneof![
        3 => (0..SITES, arbitrary_edit_op()).prop_map(|(client, op)| HubStep::Edit { client, op }),
        3 => (0..SITES).prop_map(|client| HubStep::Upload { client }),
        3 => (0..SITES).prop_map(|client| HubStep::Download { client }),
        1 => (0..SITES).prop_map(|client| HubStep::Report { client }),
        1 => Just(HubStep::Compact),
    ]
}

enum Up {
    Op(Operation),
    Frontier(VectorClock),
}

enum Down {
    Op(Operation),
    SafePoint(VectorClock),
}

struct Hub {
    hub: TextStore,
    /// What the hub knows each client has applied.
    known: Vec<VectorClock>,
    clients: Vec<TextStore>,
    up: Vec<VecDeque<Up>>,
    down: Vec<VecDeque<Down>>,
}

impl Hub {
    fn new() -> Self {
        let hub = TextStore::with_content(SiteId::from_u128(100), "seed text");
        let clients = (0..SITES)
            .map(|i| TextStore::from_snapshot(SiteId::from_u128(i as u128 + 1), hub.snapshot()))
            .collect();
        Self {
            known: vec![hub.clock().clone(); SITES],
            hub,
            clients,
            up: (0..SITES).map(|_| VecDeque::new()).collect(),
            down: (0..SITES).map(|_| VecDeque::new()).collect(),
        }
    }

    fn step(&mut self, step: &HubStep) {
        match step {
            HubStep::Edit { client, op } => {
                for op in apply_edit(&mut self.clients[*client], op) {
                    self.up[*client].push_back(Up::Op(op));
                }
            }
            HubStep::Upload { client } => match self.up[*client].pop_front() {
                Some(Up::Op(op)) => {
                    self.hub.apply_remote(op.clone()).expect("hub accepts client operation");
                    self.known[*client].merge(&op.clock);
                    for (to, link) in self.down.iter_mut().enumerate() {
                        if to != *client {
                            link.push_back(Down::Op(op.clone()));
                        }
                    }
                }
                Some(Up::Frontier(clock)) => {
                    let capped = clock.meet(self.hub.clock());
                    self.known[*client].merge(&capped);
                }
                None => {}
            },
            HubStep::Download { client } => {
                let store = &mut self.clients[*client];
                match self.down[*client].pop_front() {
                    Some(Down::Op(op)) => {
                        store.apply_remote(op).expect("client accepts relayed operation");
                    }
                    Some(Down::SafePoint(safe)) if store.deferred_len() == 0 => {
                        let safe = safe.meet(store.clock());
                        store.compact(&safe);
                    }
                    Some(Down::SafePoint(_)) | None => {}
                }
            }
            HubStep::Report { client } => {
                let clock = self.clients[*client].clock().clone();
                self.up[*client].push_back(Up::Frontier(clock));
            }
            HubStep::Compact => {
                let safe = safe_point(self.known.iter().chain(std::iter::once(self.hub.clock())));
                self.hub.compact(&safe);
                for link in &mut self.down {
                    link.push_back(Down::SafePoint(safe.clone()));
                }
            }
        }
    }

    /// Flush every link until nothing is in flight.
    fn settle(&mut self) {
        while self.up.iter().any(|q| !q.is_empty()) || self.down.iter().any(|q| !q.is_empty()) {
            for client in 0..SITES {
                self.step(&HubStep::Upload { client });
            }
            for client in 0..SITES {
                self.step(&HubStep::Download { client });
            }
        }
    }

    fn stores(&self) -> Vec<&TextStore> {
        std::iter::once(&self.hub).chain(self.clients.iter()).collect()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_replicas_converge(
        steps in prop::collection::vec(arbitrary_step(), 1..60),
        orders in arbitrary_orders(),
    ) {
        let mut mesh = Mesh::new();
        mesh.run(&steps);
        mesh.drain(&orders);
        assert_converged(&mesh.stores())?;
    }

    #[test]
    fn prop_delivery_order_does_not_matter(
        steps in prop::collection::vec(arbitrary_step(), 1..40),
        first in arbitrary_orders(),
        second in arbitrary_orders(),
    ) {
        let mut a = Mesh::new();
        let mut b = Mesh::new();
        a.run(&steps);
        b.run(&steps);
        a.drain(&first);
        b.drain(&second);
        prop_assert_eq!(a.stores[0].render(), b.stores[0].render());
        assert_converged(&a.stores())?;
    }

    #[test]
    fn prop_apply_is_idempotent(steps in prop::collection::vec(arbitrary_step(), 1..30)) {
        let mut mesh = Mesh::new();
        mesh.run(&steps);
        let all = mesh.sent;

        let mut once = TextStore::with_content(SiteId::from_u128(99), "seed");
        let mut twice = TextStore::with_content(SiteId::from_u128(98), "seed");
        for op in &all {
            once.apply_remote(op.clone()).expect("valid operation");
            twice.apply_remote(op.clone()).expect("valid operation");
            twice.apply_remote(op.clone()).expect("valid operation");
        }
        prop_assert_eq!(once.render(), twice.render());
        prop_assert_eq!(once.entry_count(), twice.entry_count());
    }

    #[test]
    fn prop_compaction_with_edits_in_flight(steps in prop::collection::vec(arbitrary_hub_step(), 1..80)) {
        let mut hub = Hub::new();
        for step in &steps {
            hub.step(step);
        }
        hub.settle();
        assert_converged(&hub.stores())?;

        // Once everyone has reported, the final compaction reaches every
        // replica and leaves the text alone.
        let rendered = hub.hub.render();
        for client in 0..SITES {
            hub.step(&HubStep::Report { client });
        }
        hub.settle();
        hub.step(&HubStep::Compact);
        hub.settle();
        assert_converged(&hub.stores())?;
        prop_assert_eq!(hub.hub.render(), rendered);
        for store in hub.stores() {
            prop_assert_eq!(store.tombstone_count(), hub.hub.tombstone_count());
        }
    }

    #[test]
    fn prop_own_counter_strictly_increases(ops in prop::collection::vec(arbitrary_edit_op(), 1..20)) {
        let site = SiteId::from_u128(1);
        let mut store = TextStore::new(site);
        let mut last = 0;
        for op in &ops {
            for emitted in apply_edit(&mut store, op) {
                prop_assert_eq!(emitted.id.counter, last + 1);
                last = emitted.id.counter;
            }
        }
        prop_assert_eq!(store.clock().get(&site), last);
    }
}

#[test]
fn test_deleted_text_never_reappears() {
    let mut p1 = TextStore::with_content(SiteId::from_u128(1), "hello");
    let mut p2 = TextStore::with_content(SiteId::from_u128(2), "hello");

    let deletes: Vec<Operation> = p1.delete_range(1..4).unwrap().into_iter().map(|a| a.op).collect();
    let inserts: Vec<Operation> = p2.insert_at(3, "XY").unwrap().into_iter().map(|a| a.op).collect();

    for op in &inserts {
        p1.apply_remote(op.clone()).unwrap();
    }
    for op in deletes.iter().rev() {
        p2.apply_remote(op.clone()).unwrap();
    }

    assert_eq!(p1.render(), p2.render());
    assert_eq!(p1.render(), "hXYo");
}

#[test]
fn test_edit_anchored_on_deleted_text_survives_hub_compaction() {
    let mut hub = Hub::new();
    // Client 1 types after "text" while client 0 deletes it; client 1's
    // edit is still on its way to the hub.
    hub.step(&HubStep::Edit {
        client: 1,
        op: EditOp::Insert { pos_pct: 1.0, text: "!".into() },
    });
    hub.step(&HubStep::Edit {
        client: 0,
        op: EditOp::Delete { pos_pct: 0.5, len_pct: 1.0 },
    });
    hub.step(&HubStep::Upload { client: 0 });
    for client in 0..SITES {
        hub.step(&HubStep::Download { client });
    }
    hub.step(&HubStep::Report { client: 2 });
    hub.step(&HubStep::Upload { client: 2 });
    hub.step(&HubStep::Compact);
    for client in [0, 2] {
        hub.step(&HubStep::Download { client });
    }

    hub.settle();
    let stores = hub.stores();
    assert!(stores.iter().all(|s| s.render() == stores[0].render()));
    assert!(stores[0].render().ends_with('!'));
}
