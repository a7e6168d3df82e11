use crate::models::AttemptResult;

/// What the participant sees for the current item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemView {
    pub index: usize,
    pub total: usize,
    pub text: String,
    pub options: Vec<String>,
    pub remaining_seconds: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalView {
    Completed {
        /// Client-side score, display only
        advisory_score: u32,
        max_points: u32,
        /// Authoritative result when the submit reached the server
        confirmed: Option<AttemptResult>,
    },
    Locked,
}

impl TerminalView {
    /// Participant-facing text. A lock never says why it happened.
    pub fn message(&self) -> String {
        match self {
            TerminalView::Completed {
                confirmed: Some(result),
                ..
            } => format!(
                "Attempt submitted. Score: {}/{} ({} of {} correct)",
                result.score_points, result.max_points, result.correct_answers, result.total_items
            ),
            TerminalView::Completed {
                advisory_score,
                max_points,
                confirmed: None,
            } => format!(
                "Attempt finished. Provisional score: {}/{}",
                advisory_score, max_points
            ),
            TerminalView::Locked => "This session has been locked.".to_string(),
        }
    }
}

/// Presentation seam of a running attempt. Exclusive mode (fullscreen in a
/// browser) may fail on either side; callers ignore those failures.
///
/// `show_item` runs while the monitor holds its progress lock and must not call
/// back into the monitor.
pub trait AttemptSurface: Send + Sync {
    fn show_item(&self, view: &ItemView);

    fn show_terminal(&self, view: &TerminalView);

    /// Initialization failed; the participant goes back to code entry.
    fn show_aborted(&self, reason: &str);

    fn enter_exclusive_mode(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn release_exclusive_mode(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_message_is_generic() {
        let message = TerminalView::Locked.message();
        assert!(!message.to_lowercase().contains("duplicate"));
        assert!(message.contains("locked"));
    }

    #[test]
    fn completed_message_prefers_confirmed_result() {
        let view = TerminalView::Completed {
            advisory_score: 3,
            max_points: 4,
            confirmed: Some(AttemptResult {
                score_points: 2,
                max_points: 4,
                correct_answers: 2,
                total_items: 4,
            }),
        };
        assert!(view.message().contains("2/4"));
    }
}
