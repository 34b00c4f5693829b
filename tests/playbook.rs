// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use {tokio::runtime::Runtime, tokio_util::sync::CancellationToken};

    use kubeboot_lib::{
        error::ExecutionError,
        executor::{AnsibleRunner, Execution, ExecutionStatus, Executor, Mode, Procedure},
        test_env::*,
    };

    /// Run the fake playbook program once through an executor, collecting its output.
    fn execute(env: &TestEnvironment, mode: Mode) -> (Execution, Vec<String>) {
        let executor = env.ansible_executor();
        let mut output = Vec::new();
        let rt = Runtime::new().unwrap();
        let execution = rt.block_on(executor.execute(
            &three_node_inventory(),
            mode,
            &mut |line: &str| output.push(line.to_string()),
            &CancellationToken::new(),
        ));
        (execution, output)
    }

    #[test]
    fn deploy_runs_against_the_written_inventory() {
        let env = TestEnvironment::new("deploy_runs_against_the_written_inventory");
        env.set_playbook_behaviors(&["ok"]);

        let (execution, output) = execute(&env, Mode::Deploy);

        assert!(execution.result.is_ok());
        assert_eq!(execution.attempts.len(), 1);
        assert!(output.iter().any(|l| l == "PLAY RECAP"));
        assert!(output
            .iter()
            .any(|l| l == &format!("cache: {}", env.fact_cache_dir().display())));

        assert_eq!(
            env.playbook_invocations(),
            vec![format!("-i {} cluster.yml", env.inventory_path().display())]
        );
        assert_eq!(
            std::fs::read(env.inventory_path()).unwrap(),
            three_node_inventory().as_bytes()
        );

        let record = execution.record().unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded);
        assert!(record.command.ends_with("cluster.yml"));
        assert!(record.started <= record.finished);
        assert_eq!(record.output, output);
    }

    #[test]
    fn output_that_is_not_utf8_does_not_fail_the_run() {
        let env = TestEnvironment::new("output_that_is_not_utf8_does_not_fail_the_run");
        env.set_playbook_behaviors(&["latin1"]);

        let (execution, output) = execute(&env, Mode::Deploy);

        assert!(execution.result.is_ok());
        assert_eq!(execution.attempts.len(), 1);
        assert_eq!(execution.attempts[0].status, ExecutionStatus::Succeeded);
        assert!(output.iter().any(|l| l == "TASK [caf\u{FFFD}]"));
        assert!(output.iter().any(|l| l == "no trailing newline"));
        assert!(output.iter().any(|l| l == "PLAY RECAP"));
    }

    #[test]
    fn reset_is_confirmed() {
        let env = TestEnvironment::new("reset_is_confirmed");

        let (execution, _) = execute(&env, Mode::Reset);

        assert!(execution.result.is_ok());
        assert_eq!(
            env.playbook_invocations(),
            vec![format!(
                "-i {} -e reset_confirmation=yes reset.yml",
                env.inventory_path().display()
            )]
        );
    }

    #[test]
    fn stale_cache_is_cleared_and_retried() {
        let env = TestEnvironment::new("stale_cache_is_cleared_and_retried");
        env.set_playbook_behaviors(&["stale", "ok"]);
        std::fs::create_dir_all(env.fact_cache_dir()).unwrap();
        std::fs::write(env.fact_cache_dir().join("knode01"), "{}").unwrap();

        let (execution, _) = execute(&env, Mode::Deploy);

        assert!(execution.result.is_ok());
        assert_eq!(env.playbook_invocations().len(), 2);
        assert!(!env.fact_cache_dir().join("knode01").exists());
        assert_eq!(
            execution.attempts[0].status,
            ExecutionStatus::Failed { exit_code: 2 }
        );
        assert_eq!(execution.attempts[1].attempt, 2);
    }

    #[test]
    fn failed_retry_is_not_retried_again() {
        let env = TestEnvironment::new("failed_retry_is_not_retried_again");
        env.set_playbook_behaviors(&["stale", "stale", "ok"]);

        let (execution, _) = execute(&env, Mode::Deploy);

        assert!(matches!(
            execution.result,
            Err(ExecutionError::StaleCache { exit_code: 2 })
        ));
        assert_eq!(env.playbook_invocations().len(), 2);
        assert_eq!(execution.attempts.len(), 2);
    }

    #[test]
    fn ordinary_failure_is_not_retried() {
        let env = TestEnvironment::new("ordinary_failure_is_not_retried");
        env.set_playbook_behaviors(&["fail", "ok"]);

        let (execution, output) = execute(&env, Mode::Deploy);

        assert!(matches!(
            execution.result,
            Err(ExecutionError::Failed { exit_code: 4 })
        ));
        assert_eq!(env.playbook_invocations().len(), 1);
        assert!(output.iter().any(|l| l.contains("UNREACHABLE")));
    }

    #[test]
    fn cancel_terminates_the_playbook() {
        let env = TestEnvironment::new("cancel_terminates_the_playbook");
        env.set_playbook_behaviors(&["hang"]);
        let executor = env.ansible_executor();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let rt = Runtime::new().unwrap();
        let started = std::time::Instant::now();
        let execution = rt.block_on(executor.execute(
            &three_node_inventory(),
            Mode::Deploy,
            &mut |line: &str| {
                if line.starts_with("cache:") {
                    trigger.cancel();
                }
            },
            &cancel,
        ));

        assert!(matches!(execution.result, Err(ExecutionError::Aborted)));
        assert_eq!(execution.attempts[0].status, ExecutionStatus::Aborted);
        assert!(started.elapsed() < std::time::Duration::from_secs(20));
    }

    #[test]
    fn missing_program_fails_to_launch() {
        let env = TestEnvironment::new("missing_program_fails_to_launch");
        let mut options = env.playbook_options();
        options.program = Some(test_path("fake_bin/no-such-program"));
        let executor = Executor::new(AnsibleRunner::new(&options), Procedure::from_options(&options));

        let rt = Runtime::new().unwrap();
        let execution = rt.block_on(executor.execute(
            &three_node_inventory(),
            Mode::Deploy,
            &mut |_: &str| {},
            &CancellationToken::new(),
        ));

        assert!(matches!(
            execution.result,
            Err(ExecutionError::Spawn { .. })
        ));
        assert!(matches!(
            execution.attempts[0].status,
            ExecutionStatus::LaunchFailed(_)
        ));
    }
}
