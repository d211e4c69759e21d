use jupyter_protocol::{ErrorOutput, ExecuteReply, ReplyStatus};

use crate::protocol::{reply_error, text_bundle, MimeBundle, ParentContext};

/// What one execution produced.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub reply: ExecuteReply,
    /// Output bundles in arrival order, after clears and display updates.
    pub outputs: Vec<MimeBundle>,
    pub error: Option<ErrorOutput>,
}

impl ExecutionOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.reply.status == ReplyStatus::Ok
    }
}

#[derive(Debug)]
struct OutputEntry {
    data: MimeBundle,
    display_id: Option<String>,
}

/// Accumulator for the single execution currently in flight.
#[derive(Debug)]
pub(crate) struct PendingExecution {
    parent: ParentContext,
    outputs: Vec<OutputEntry>,
    clear_on_next: bool,
    error: Option<ErrorOutput>,
}

impl PendingExecution {
    pub(crate) fn new(parent: ParentContext) -> Self {
        Self {
            parent,
            outputs: Vec::new(),
            clear_on_next: false,
            error: None,
        }
    }

    pub(crate) fn parent(&self) -> &ParentContext {
        &self.parent
    }

    /// Whether a notification attributed to `parent` belongs here. Notifications
    /// without a parent are attributed to whatever is running.
    pub(crate) fn owns(&self, parent: Option<&ParentContext>) -> bool {
        parent.map_or(true, |parent| parent.msg_id == self.parent.msg_id)
    }

    pub(crate) fn push_stream(&mut self, text: &str) {
        self.push(text_bundle(text), None);
    }

    pub(crate) fn push(&mut self, data: MimeBundle, display_id: Option<String>) {
        if self.clear_on_next {
            self.outputs.clear();
            self.clear_on_next = false;
        }
        self.outputs.push(OutputEntry { data, display_id });
    }

    /// Replace every output shown under `display_id`. Returns whether any
    /// matched.
    pub(crate) fn update_display(&mut self, display_id: &str, data: &MimeBundle) -> bool {
        let mut matched = false;
        for entry in &mut self.outputs {
            if entry.display_id.as_deref() == Some(display_id) {
                entry.data = data.clone();
                matched = true;
            }
        }
        matched
    }

    /// Clear now, or when the next output arrives if `wait` is set.
    pub(crate) fn clear(&mut self, wait: bool) {
        if wait {
            self.clear_on_next = true;
        } else {
            self.outputs.clear();
            self.clear_on_next = false;
        }
    }

    pub(crate) fn fail(&mut self, error: ErrorOutput) {
        self.error = Some(error);
    }

    pub(crate) fn finish(self, reply: ExecuteReply) -> ExecutionOutcome {
        let error = self.error.or_else(|| reply_error(&reply));
        ExecutionOutcome {
            reply,
            outputs: self.outputs.into_iter().map(|entry| entry.data).collect(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{execute_failed, execute_ok};
    use jupyter_protocol::ExecutionCount;

    fn ok() -> ExecuteReply {
        execute_ok(ExecutionCount::new(1))
    }

    fn pending() -> PendingExecution {
        PendingExecution::new(ParentContext::new("s", "execute_request"))
    }

    fn texts(outcome: &ExecutionOutcome) -> Vec<&str> {
        outcome
            .outputs
            .iter()
            .map(|b| b["text/plain"].as_str().unwrap())
            .collect()
    }

    #[test]
    fn test_outputs_keep_arrival_order() {
        let mut execution = pending();
        execution.push_stream("a");
        execution.push(text_bundle("b"), None);
        let outcome = execution.finish(ok());
        assert_eq!(texts(&outcome), vec!["a", "b"]);
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_clear_now() {
        let mut execution = pending();
        execution.push_stream("gone");
        execution.clear(false);
        execution.push_stream("kept");
        assert_eq!(texts(&execution.finish(ok())), vec!["kept"]);
    }

    #[test]
    fn test_clear_wait_defers_until_next_output() {
        let mut execution = pending();
        execution.push_stream("first");
        execution.clear(true);
        assert_eq!(execution.outputs.len(), 1);

        execution.push_stream("second");
        execution.push_stream("third");
        assert_eq!(
            texts(&execution.finish(ok())),
            vec!["second", "third"]
        );
    }

    #[test]
    fn test_clear_wait_without_followup_keeps_output() {
        let mut execution = pending();
        execution.push_stream("stays");
        execution.clear(true);
        assert_eq!(texts(&execution.finish(ok())), vec!["stays"]);
    }

    #[test]
    fn test_update_display_replaces_in_place() {
        let mut execution = pending();
        execution.push(text_bundle("0%"), Some("progress".to_string()));
        execution.push_stream("log");
        assert!(execution.update_display("progress", &text_bundle("100%")));
        assert!(!execution.update_display("other", &text_bundle("x")));
        assert_eq!(
            texts(&execution.finish(ok())),
            vec!["100%", "log"]
        );
    }

    #[test]
    fn test_error_from_reply_when_not_notified() {
        let error = ErrorOutput {
            ename: "E".to_string(),
            evalue: "v".to_string(),
            traceback: vec![],
        };
        let outcome = pending().finish(execute_failed(ExecutionCount::new(2), &error));
        assert!(!outcome.is_ok());
        assert_eq!(outcome.error.unwrap().ename, "E");
    }

    #[test]
    fn test_owns() {
        let execution = pending();
        let own = execution.parent().clone();
        assert!(execution.owns(Some(&own)));
        assert!(execution.owns(None));
        assert!(!execution.owns(Some(&ParentContext::new("s", "execute_request"))));
    }
}
