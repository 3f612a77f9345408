use super::*;
use chrono::TimeZone;

fn started_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

// A three-device run where one device was committed, one was unchanged, and one failed.
fn partial_summary() -> RunSummary {
    let mut summary = RunSummary::new(started_at(), 3);
    summary.record("r1", DeviceStatus::Committed);
    summary.record("r2", DeviceStatus::failed("cannot reach 192.0.2.2:22: refused"));
    summary.record("r3", DeviceStatus::Unchanged);
    summary
}

mod run_summary {
    use super::*;

    #[test]
    fn counts_outcomes() {
        let summary = partial_summary();
        assert_eq!(3, summary.attempted);
        assert_eq!(2, summary.succeeded);
        assert_eq!(1, summary.failed);
        assert_eq!(1, summary.committed);
        assert_eq!(1, summary.unchanged);
        assert_eq!(
            vec![("r2", "cannot reach 192.0.2.2:22: refused")],
            summary.failures().collect::<Vec<_>>(),
        );
    }

    #[test]
    fn status_and_exit_code() {
        let mut summary = RunSummary::new(started_at(), 2);
        summary.record("r1", DeviceStatus::Committed);
        summary.record("r2", DeviceStatus::Unchanged);
        assert_eq!(RunStatus::Success, summary.status());
        assert_eq!(0, summary.exit_code());

        assert_eq!(RunStatus::Partial, partial_summary().status());
        assert_ne!(0, partial_summary().exit_code());

        let mut summary = RunSummary::new(started_at(), 2);
        summary.record("r1", DeviceStatus::failed("x"));
        summary.record("r2", DeviceStatus::failed("y"));
        assert_eq!(RunStatus::Failed, summary.status());
        assert_eq!(1, summary.exit_code());
    }

    #[test]
    fn empty_run_succeeds() {
        let summary = RunSummary::new(started_at(), 0);
        assert_eq!(RunStatus::Success, summary.status());
        assert_eq!(0, summary.exit_code());
    }

    #[test]
    fn cancel_fails_unfinished_devices() {
        let mut summary = RunSummary::new(started_at(), 3);
        summary.record("r1", DeviceStatus::Committed);
        summary.cancel(["r2", "r3"]);

        assert_eq!(RunStatus::Cancelled, summary.status());
        assert_eq!(130, summary.exit_code());
        assert_eq!(summary.attempted, summary.succeeded + summary.failed);
        assert_eq!(2, summary.failures().count());
    }

    #[test]
    fn to_yaml() {
        let mut summary = partial_summary();
        summary.finish(started_at() + chrono::Duration::seconds(5));
        let yaml: serde_yaml::Value = serde_yaml::from_str(&summary.to_yaml().unwrap()).unwrap();

        assert_eq!("partial", yaml["status"].as_str().unwrap());
        assert_eq!(3, yaml["attempted"].as_u64().unwrap());
        assert_eq!("2024-03-01T12:00:05Z", yaml["finished_at"].as_str().unwrap());
        let devices = yaml["devices"].as_sequence().unwrap();
        assert_eq!("r1", devices[0]["hostname"].as_str().unwrap());
        assert_eq!("committed", devices[0]["outcome"].as_str().unwrap());
        assert_eq!("failed", devices[1]["outcome"].as_str().unwrap());
        assert_eq!(
            "cannot reach 192.0.2.2:22: refused",
            devices[1]["reason"].as_str().unwrap(),
        );
    }
}

mod _starting {
    use super::*;

    #[test]
    fn works() {
        let mut stdout = vec![];
        _starting(&mut stdout, 3, started_at()).unwrap();
        assert_eq!(
            "Stockpiling 3 devices at 2024-03-01T12:00:00Z\n",
            String::from_utf8_lossy(&stdout),
        );

        let mut stdout = vec![];
        _starting(&mut stdout, 1, started_at()).unwrap();
        assert!(String::from_utf8_lossy(&stdout).starts_with("Stockpiling 1 device at"));
    }
}

mod _device {
    use super::*;

    fn report(status: DeviceStatus) -> (String, String) {
        let (mut stdout, mut stderr) = (vec![], vec![]);
        let record = DeviceRecord {
            hostname: "r1".to_owned(),
            status,
        };
        _device(&mut stdout, &mut stderr, &record).unwrap();
        (
            String::from_utf8(stdout).unwrap(),
            String::from_utf8(stderr).unwrap(),
        )
    }

    #[test]
    fn successes_go_to_stdout() {
        assert_eq!(
            ("[r1] Stockpile committed\n".to_owned(), String::new()),
            report(DeviceStatus::Committed),
        );
        assert_eq!(
            ("[r1] Stockpile unchanged\n".to_owned(), String::new()),
            report(DeviceStatus::Unchanged),
        );
    }

    #[test]
    fn failures_go_to_stderr() {
        assert_eq!(
            (String::new(), "[r1] Stockpile failed: timed out after 5s\n".to_owned()),
            report(DeviceStatus::failed("timed out after 5s")),
        );
    }
}

mod _output {
    use super::*;

    #[test]
    fn indents_output() {
        let mut stdout = vec![];
        _output(&mut stdout, "r1", "Cisco IOS Software\nuptime is 2 weeks\n").unwrap();
        assert_eq!(
            "[r1] Output:\n    Cisco IOS Software\n    uptime is 2 weeks\n",
            String::from_utf8_lossy(&stdout),
        );
    }
}

mod _summary {
    use super::*;

    #[test]
    fn lists_one_line_per_failure() {
        let (mut stdout, mut stderr) = (vec![], vec![]);
        _summary(&mut stdout, &mut stderr, &partial_summary()).unwrap();

        assert_eq!(
            "Run partially succeeded: 2 of 3 devices succeeded (1 committed, 1 unchanged), 1 failed\n",
            String::from_utf8_lossy(&stdout),
        );
        assert_eq!(
            "Failed devices:\n    [r2] cannot reach 192.0.2.2:22: refused\n",
            String::from_utf8_lossy(&stderr),
        );
    }

    #[test]
    fn no_failures_no_failure_section() {
        let (mut stdout, mut stderr) = (vec![], vec![]);
        let summary = RunSummary::new(started_at(), 0);
        _summary(&mut stdout, &mut stderr, &summary).unwrap();

        assert_eq!(
            "Run succeeded: 0 of 0 devices succeeded (0 committed, 0 unchanged), 0 failed\n",
            String::from_utf8_lossy(&stdout),
        );
        assert!(stderr.is_empty());
    }
}
