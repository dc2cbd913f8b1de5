use super::*;

use std::fs;

use serde::Serialize;
use serde_json::ser::PrettyFormatter;

/// Seconds with eight decimal places.
pub fn format_seconds(elapsed: Duration) -> String {
    format!("{:.8}", elapsed.as_secs_f64())
}

/// Ordered phase durations for one worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseReport {
    name: String,
    phases: Vec<(String, Duration)>,
}

impl PhaseReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&mut self, phase: impl Into<String>, elapsed: Duration) {
        self.phases.push((phase.into(), elapsed));
    }

    pub fn phases(&self) -> &[(String, Duration)] {
        &self.phases
    }

    pub fn get(&self, phase: &str) -> Option<Duration> {
        self.phases
            .iter()
            .find(|(name, _)| name == phase)
            .map(|(_, elapsed)| *elapsed)
    }

    pub fn file_name(&self) -> String {
        format!("results-{}.json", self.name)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .phases
            .iter()
            .map(|(phase, elapsed)| (phase.clone(), format_seconds(*elapsed).into()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// JSON text indented by four spaces.
    pub fn to_pretty_json(&self) -> Result<String, CozipOffloadError> {
        let mut out = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
        self.to_json().serialize(&mut serializer)?;
        String::from_utf8(out).map_err(|_| CozipOffloadError::Internal("report is not utf-8"))
    }

    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf, CozipOffloadError> {
        let path = dir.join(self.file_name());
        fs::write(&path, self.to_pretty_json()?)?;
        debug!(path = %path.display(), "report written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_use_eight_decimals() {
        assert_eq!(format_seconds(Duration::from_millis(1500)), "1.50000000");
        assert_eq!(format_seconds(Duration::from_nanos(12)), "0.00000001");
        assert_eq!(format_seconds(Duration::ZERO), "0.00000000");
    }

    #[test]
    fn report_keeps_phase_order_and_indent() {
        let mut report = PhaseReport::new("cpu-compress-deflate");
        report.record("overall_submission_elapsed", Duration::from_millis(250));
        report.record("joined_submission_elapsed", Duration::from_secs(1));

        let text = report.to_pretty_json().expect("report should serialize");
        assert_eq!(
            text,
            "{\n    \"overall_submission_elapsed\": \"0.25000000\",\n    \"joined_submission_elapsed\": \"1.00000000\"\n}"
        );
    }

    #[test]
    fn report_lands_in_named_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut report = PhaseReport::new("accel-decompress-lz4");
        report.record("ctx_stop_elapsed", Duration::from_micros(3));

        let path = report.write_to_dir(dir.path()).expect("write should succeed");
        assert_eq!(
            path.file_name().and_then(|name| name.to_str()),
            Some("results-accel-decompress-lz4.json")
        );
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("report readable"))
                .expect("report is json");
        assert_eq!(parsed["ctx_stop_elapsed"], "0.00000300");
        assert_eq!(report.get("ctx_stop_elapsed"), Some(Duration::from_micros(3)));
    }
}
