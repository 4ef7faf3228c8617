pub mod completions;
pub mod config;
pub mod run;

use lifeline_model::{TransitionError, UnitState};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_PLAN_ERROR: u8 = 2;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn colorize_state(state: UnitState) -> String {
    use console::Style;
    let text = state.to_string();
    match state {
        UnitState::Active => Style::new().cyan().bold().apply_to(text).to_string(),
        UnitState::Resolved => Style::new().green().apply_to(text).to_string(),
        UnitState::Installed => Style::new().yellow().apply_to(text).to_string(),
        UnitState::Starting | UnitState::Stopping => Style::new().blue().apply_to(text).to_string(),
        UnitState::Uninstalled | UnitState::StateLess => {
            Style::new().dim().apply_to(text).to_string()
        }
    }
}

pub fn colorize_error(error: TransitionError) -> String {
    use console::Style;
    if error.is_error() {
        Style::new().red().apply_to(error.to_string()).to_string()
    } else {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_state_keeps_name() {
        for state in [
            UnitState::Active,
            UnitState::Resolved,
            UnitState::Installed,
            UnitState::Stopping,
            UnitState::Uninstalled,
        ] {
            assert!(colorize_state(state).contains(&state.to_string()));
        }
    }

    #[test]
    fn colorize_error_keeps_name() {
        assert!(colorize_error(TransitionError::Duplicate).contains("duplicate"));
        assert_eq!(colorize_error(TransitionError::NoError), "none");
    }
}
