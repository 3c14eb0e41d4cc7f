use std::time::Duration;

use simfleet_engine::InstanceOutcome;

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

/// `used / total` in one unit picked from `total`, e.g. `512 GB / 1862 GB`.
pub fn format_kib_used_total(used_kib: u64, total_kib: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1024 * 1024 * 1024, "TB"),
        (1024 * 1024, "GB"),
        (1024, "MB"),
        (1, "kB"),
    ];
    let (scale, unit) = UNITS
        .into_iter()
        .find(|(scale, _)| *scale == 1 || total_kib > *scale)
        .unwrap_or((1, "kB"));
    format!("{} {unit} / {} {unit}", used_kib / scale, total_kib / scale)
}

fn outcome_status(outcome: &InstanceOutcome) -> String {
    if let Some(err) = &outcome.error {
        return format!("failed: {err}");
    }
    match (outcome.completed, outcome.exit_code) {
        (true, Some(0)) => "completed".to_string(),
        (true, Some(code)) => format!("completed (exit {code})"),
        (true, None) => "completed".to_string(),
        (false, _) => "not recorded".to_string(),
    }
}

/// One line per finished instance, e.g. `villin #2 on 1:0: completed in 3m05s (archives 1/2)`.
pub fn format_outcome_line(outcome: &InstanceOutcome) -> String {
    let mut line = format!(
        "{} #{} on {}: {} in {}",
        outcome.instance.job_name,
        outcome.instance.sequence,
        outcome.resource,
        outcome_status(outcome),
        format_duration(Duration::from_millis(outcome.total_ms)),
    );
    let archives = outcome.archives_ok.len() + outcome.archives_failed.len();
    if archives > 0 {
        line.push_str(&format!(
            " (archives {}/{archives})",
            outcome.archives_ok.len()
        ));
    }
    line
}

#[cfg(test)]
mod tests {
    use simfleet_core::ResourceKey;
    use simfleet_engine::InstanceSummary;

    use super::*;

    fn outcome() -> InstanceOutcome {
        InstanceOutcome {
            resource: ResourceKey::new(1, 0),
            instance: InstanceSummary {
                instance_id: 7,
                job_id: 1,
                job_name: "villin".to_string(),
                sequence: 2,
                pid: Some(4242),
            },
            completed: true,
            exit_code: Some(0),
            error: None,
            archives_ok: vec![1],
            archives_failed: vec!["archive 2: transport failure".to_string()],
            total_ms: 185_000,
            finished_at: 0,
        }
    }

    #[test]
    fn durations_pick_a_readable_unit() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(185)), "3m05s");
        assert_eq!(format_duration(Duration::from_secs(7260)), "2h01m");
    }

    #[test]
    fn capacity_uses_the_unit_of_the_total() {
        assert_eq!(format_kib_used_total(300, 900), "300 kB / 900 kB");
        assert_eq!(format_kib_used_total(2048, 10 * 1024), "2 MB / 10 MB");
        assert_eq!(
            format_kib_used_total(512 * 1024 * 1024, 1862 * 1024 * 1024),
            "512 GB / 1862 GB"
        );
        assert_eq!(
            format_kib_used_total(1024 * 1024 * 1024, 3 * 1024 * 1024 * 1024),
            "1 TB / 3 TB"
        );
        // Exactly one unit stays in the smaller unit.
        assert_eq!(format_kib_used_total(0, 1024), "0 kB / 1024 kB");
    }

    #[test]
    fn outcome_line_mentions_status_and_archives() {
        assert_eq!(
            format_outcome_line(&outcome()),
            "villin #2 on 1:0: completed in 3m05s (archives 1/2)"
        );

        let mut failed = outcome();
        failed.completed = false;
        failed.exit_code = None;
        failed.error = Some("launch printed no pid".to_string());
        failed.archives_ok.clear();
        failed.archives_failed.clear();
        failed.total_ms = 400;
        assert_eq!(
            format_outcome_line(&failed),
            "villin #2 on 1:0: failed: launch printed no pid in 0.4s"
        );
    }
}
