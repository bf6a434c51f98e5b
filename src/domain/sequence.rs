use serde::{Deserialize, Serialize};

/// One step of a turn-on/turn-off recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SequenceStep {
    /// Command a named output's relay, with per-step retry.
    ChangeOutput {
        output: String,
        turn_on: bool,
        #[serde(default)]
        retries: u32,
        #[serde(default = "default_backoff_secs")]
        retry_backoff_secs: u64,
    },
    Sleep { seconds: u64 },
    /// Re-read a device's status so later steps observe fresh state.
    RefreshStatus { device: String },
    /// Ask a mobile device for its current location.
    GetLocation { device: String },
}

fn default_backoff_secs() -> u64 {
    2
}

/// An ordered recipe with an overall wall-clock timeout. Exceeding the
/// timeout cancels the remaining steps and fails the sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    pub timeout_secs: u64,
    pub steps: Vec<SequenceStep>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_deserialize_from_tagged_yaml() {
        let yaml = r#"
name: heater-on
timeout_secs: 120
steps:
  - action: change_output
    output: heater-contactor
    turn_on: true
    retries: 2
  - action: sleep
    seconds: 10
  - action: refresh_status
    device: shed-shelly
"#;
        let seq: Sequence = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(seq.steps.len(), 3);
        assert!(matches!(
            &seq.steps[0],
            SequenceStep::ChangeOutput { output, turn_on: true, retries: 2, retry_backoff_secs: 2 }
                if output == "heater-contactor"
        ));
        assert!(matches!(seq.steps[1], SequenceStep::Sleep { seconds: 10 }));
    }
}
