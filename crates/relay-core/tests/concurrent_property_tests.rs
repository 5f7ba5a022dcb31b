//! Concurrent invocations with independently scripted failures must each end
//! in their own outcome, with no handle leaking between them.

mod common;

use common::{drain_events, Rig};
use proptest::prelude::*;
use relay_core::{ErrorKind, RelayError, ServerEvent};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Succeed,
    FailWriteA,
    FailWriteB,
    FailCommitA,
    FailCommitB,
}

impl Plan {
    fn directive(self) -> &'static str {
        match self {
            Plan::Succeed => "",
            Plan::FailWriteA => " #fail=write_a",
            Plan::FailWriteB => " #fail=write_b",
            Plan::FailCommitA => " #fail=commit_a",
            Plan::FailCommitB => " #fail=commit_b",
        }
    }

    fn expected(self) -> Option<ErrorKind> {
        match self {
            Plan::Succeed => None,
            Plan::FailWriteA | Plan::FailWriteB => Some(ErrorKind::Write),
            Plan::FailCommitA => Some(ErrorKind::InconsistentState),
            Plan::FailCommitB => Some(ErrorKind::PartialCommit),
        }
    }

    fn lands_on_a(self) -> bool {
        matches!(self, Plan::Succeed | Plan::FailCommitB)
    }

    fn lands_on_b(self) -> bool {
        self == Plan::Succeed
    }
}

fn plan() -> impl Strategy<Value = Plan> {
    prop_oneof![
        3 => Just(Plan::Succeed),
        1 => Just(Plan::FailWriteA),
        1 => Just(Plan::FailWriteB),
        1 => Just(Plan::FailCommitA),
        1 => Just(Plan::FailCommitB),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn concurrent_messages_keep_failures_isolated(
        plans in prop::collection::vec((plan(), 0usize..4), 1..24)
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let rig = Rig::new();
            let (_watcher, mut rx_watcher) = rig.connect("watcher");
            let mut senders = Vec::new();
            let mut receivers = Vec::new();
            for i in 0..4 {
                let (id, rx) = rig.connect(&format!("conn-{i}"));
                senders.push(id);
                receivers.push(rx);
            }

            let mut tasks = Vec::new();
            for (n, (plan, conn)) in plans.iter().copied().enumerate() {
                let ingress = rig.ingress.clone();
                let sender = senders[conn].clone();
                let text = format!("msg-{n}{}", plan.directive());
                tasks.push(tokio::spawn(async move {
                    let res = ingress.on_message(&sender, &serde_json::json!(text)).await;
                    (plan, text, res)
                }));
            }

            let mut expect_a = HashSet::new();
            let mut expect_b = HashSet::new();
            let mut successes = HashSet::new();
            for task in tasks {
                let (plan, text, res) = task.await.unwrap();
                match (plan.expected(), res) {
                    (None, Ok(_)) => {
                        successes.insert(text.clone());
                    }
                    (Some(kind), Err(RelayError::Store(e))) => assert_eq!(e.kind(), kind),
                    (want, got) => panic!("{text}: expected {want:?}, got {got:?}"),
                }
                if plan.lands_on_a() {
                    expect_a.insert(text.clone());
                }
                if plan.lands_on_b() {
                    expect_b.insert(text);
                }
            }

            let rows_a: HashSet<String> = rig.a.rows().into_iter().map(|w| w.body).collect();
            let rows_b: HashSet<String> = rig.b.rows().into_iter().map(|w| w.body).collect();
            assert_eq!(rows_a, expect_a);
            assert_eq!(rows_b, expect_b);

            // Every begin matched by exactly one release.
            assert_eq!(rig.a.begins(), rig.a.releases());
            assert_eq!(rig.b.begins(), rig.b.releases());
            assert_eq!(rig.a.begins(), plans.len());
            assert_eq!(rig.b.begins(), plans.len());

            let count = |p: Plan| plans.iter().filter(|(q, _)| *q == p).count();
            assert_eq!(
                rig.a.rollbacks(),
                count(Plan::FailWriteA) + count(Plan::FailWriteB)
            );
            assert_eq!(
                rig.b.rollbacks(),
                count(Plan::FailWriteA) + count(Plan::FailWriteB) + count(Plan::FailCommitA)
            );
            assert_eq!(
                rig.ledger.len(),
                count(Plan::FailCommitA) + count(Plan::FailCommitB)
            );

            // The watcher sees each successful message exactly once and nothing else.
            let seen: Vec<String> = drain_events(&mut rx_watcher)
                .into_iter()
                .map(|e| match e {
                    ServerEvent::ChatMessage(text) => text,
                    other => panic!("watcher got {other:?}"),
                })
                .collect();
            assert_eq!(seen.len(), successes.len());
            assert_eq!(seen.into_iter().collect::<HashSet<_>>(), successes);

            // Error notices go to the originating connection only.
            let mut notices = 0;
            for rx in receivers.iter_mut() {
                notices += drain_events(rx)
                    .into_iter()
                    .filter(|e| matches!(e, ServerEvent::ErrorMessage(_)))
                    .count();
            }
            assert_eq!(notices, plans.len() - successes.len());
        });
    }
}
