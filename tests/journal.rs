// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use chrono::Local;
    use tokio::runtime::Runtime;
    use tokio_util::sync::CancellationToken;

    use kubeboot_lib::{journal::*, test_env::*};

    const THREE_NODES: [&str; 3] = ["knode01", "knode02", "knode03"];

    #[test]
    fn serde1() {
        let record = Record {
            timestamp: Local::now().naive_local(),
            event: Event::Playbook,
            obj_id: "cluster.local".to_string(),
            comment: Some("deploy attempt 1: Succeeded".to_string()),
        };
        let output = record.as_string();

        let new_record = Record::from_string(&output).unwrap();

        assert_eq!(record, new_record);
    }

    fn events(env: &TestEnvironment) -> Vec<Event> {
        Journal::read_all(&env.journal_path())
            .unwrap()
            .into_iter()
            .map(|r| r.event)
            .collect()
    }

    #[test]
    fn deploy_is_journaled() {
        let env = TestEnvironment::new("deploy_is_journaled");
        let runner = ScriptedRunner::new(vec![Script::stale_cache()]);
        let orch = env
            .orchestrator(
                three_node_spec(),
                ScriptedProbe::new(),
                runner,
                ScriptedStatus::all_ready(&THREE_NODES),
                3,
            )
            .with_journal(Journal::open(&env.journal_path()).unwrap());

        let rt = Runtime::new().unwrap();
        let report = rt
            .block_on(orch.deploy(&CancellationToken::new(), &mut |_: &str| {}))
            .unwrap();
        assert!(report.succeeded());

        assert_eq!(
            events(&env),
            vec![
                Event::RunStart,
                Event::Playbook,
                Event::Playbook,
                Event::Deployed,
                Event::Verified,
            ]
        );

        let records = Journal::read_all(&env.journal_path()).unwrap();
        assert!(records.iter().all(|r| r.obj_id == "cluster.local"));
        assert_eq!(records[0].comment.as_deref(), Some("deploy"));
        assert!(records[1]
            .comment
            .as_deref()
            .unwrap()
            .starts_with("deploy attempt 1: Failed"));
    }

    #[test]
    fn failed_preflight_is_journaled() {
        let env = TestEnvironment::new("failed_preflight_is_journaled");
        let probe = ScriptedProbe::new()
            .with_node(
                "knode01",
                NodeState {
                    reachable: false,
                    ..NodeState::default()
                },
            )
            .with_node(
                "knode03",
                NodeState {
                    ipv4_forwarding: false,
                    ..NodeState::default()
                },
            );
        let orch = env
            .orchestrator(
                three_node_spec(),
                probe,
                ScriptedRunner::default(),
                ScriptedStatus::all_ready(&THREE_NODES),
                3,
            )
            .with_journal(Journal::open(&env.journal_path()).unwrap());

        let rt = Runtime::new().unwrap();
        rt.block_on(orch.deploy(&CancellationToken::new(), &mut |_: &str| {}))
            .unwrap();

        let records = Journal::read_all(&env.journal_path()).unwrap();
        let events: Vec<Event> = records.iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![Event::RunStart, Event::PreflightFailed, Event::RunFailed]
        );
        assert_eq!(records[1].comment.as_deref(), Some("knode01,knode03"));
        let reason = records[2].comment.as_deref().unwrap();
        assert!(reason.contains("knode01"));
        assert!(reason.contains("ipv4 forwarding disabled"));
    }
}
