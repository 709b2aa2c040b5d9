use tracing::info;

use crate::{
    ports::{LogHandle, OutputLine},
    types::{ActivationSource, Edge, SourceSet},
};

/// Anything the scheduler can switch on and off on behalf of a source.
pub trait Actuator {
    fn activate(&mut self, source: ActivationSource);
    fn deactivate(&mut self, source: ActivationSource);
    fn state(&self) -> bool;

    fn set_source(&mut self, source: ActivationSource, on: bool) {
        if on {
            self.activate(source);
        } else {
            self.deactivate(source);
        }
    }
}

/// One physical line held on by any number of sources. The line is written
/// only when the OR of all sources changes.
pub struct ActuatorOutput<L = Box<dyn OutputLine>> {
    name: String,
    line: L,
    sources: SourceSet,
    state: bool,
    log: LogHandle,
}

impl<L: OutputLine> ActuatorOutput<L> {
    pub fn new(name: impl Into<String>, mut line: L, log: LogHandle) -> Self {
        line.set(false);
        Self {
            name: name.into(),
            line,
            sources: SourceSet::default(),
            state: false,
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sources(&self) -> SourceSet {
        self.sources
    }

    pub fn is_active(&self) -> bool {
        self.state
    }

    pub fn on(&mut self, source: ActivationSource) -> bool {
        let changed = self.sources.insert(source);
        changed && self.apply(source)
    }

    pub fn off(&mut self, source: ActivationSource) -> bool {
        let changed = self.sources.remove(source);
        changed && self.apply(source)
    }

    /// Drops every source at once, e.g. when a protected run aborts.
    pub fn release_all(&mut self, reason: &str) -> bool {
        self.sources.clear();
        if !self.state {
            return false;
        }
        self.state = false;
        self.line.set(false);
        self.record(&format!("{} stop {reason}", self.name));
        true
    }

    /// Manual button edge: pressed holds the line, released lets go.
    pub fn button_edge(&mut self, edge: Edge) -> bool {
        match edge {
            Edge::Falling => self.on(ActivationSource::Manual),
            Edge::Rising => self.off(ActivationSource::Manual),
        }
    }

    /// Writes the line without touching the sources; the motor reversal
    /// sequence uses this to pulse power while the run stays logically on.
    pub(crate) fn drive_line(&mut self, on: bool) {
        self.line.set(on);
    }

    pub(crate) fn log(&self) -> &LogHandle {
        &self.log
    }

    fn apply(&mut self, source: ActivationSource) -> bool {
        let desired = self.sources.any();
        if desired == self.state {
            return false;
        }
        self.state = desired;
        self.line.set(desired);
        let verb = if desired { "start" } else { "stop" };
        self.record(&format!("{} {verb} {source}", self.name));
        true
    }

    fn record(&self, text: &str) {
        info!("{text}");
        self.log.record(text);
    }
}

impl<L: OutputLine> Actuator for ActuatorOutput<L> {
    fn activate(&mut self, source: ActivationSource) {
        self.on(source);
    }

    fn deactivate(&mut self, source: ActivationSource) {
        self.off(source);
    }

    fn state(&self) -> bool {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ports::testing::{MemoryLog, RecordingLine};

    fn output() -> (ActuatorOutput<RecordingLine>, RecordingLine, MemoryLog) {
        let line = RecordingLine::default();
        let log = MemoryLog::default();
        let output = ActuatorOutput::new("pump", line.clone(), log.handle());
        (output, line, log)
    }

    #[test]
    fn repeated_activation_writes_line_once() {
        let (mut output, line, log) = output();

        assert!(output.on(ActivationSource::Timer));
        assert!(!output.on(ActivationSource::Timer));
        assert!(!output.on(ActivationSource::Timer));

        // Initial off at construction, then a single on.
        assert_eq!(line.writes(), vec![false, true]);
        assert_eq!(log.records(), vec!["pump start timer".to_string()]);
    }

    #[test]
    fn line_stays_on_while_any_source_holds_it() {
        let (mut output, line, log) = output();

        output.activate(ActivationSource::Timer);
        output.activate(ActivationSource::Manual);
        output.deactivate(ActivationSource::Timer);
        assert!(output.state());

        output.deactivate(ActivationSource::Manual);
        assert!(!output.state());
        assert_eq!(line.writes(), vec![false, true, false]);
        assert_eq!(
            log.records(),
            vec!["pump start timer".to_string(), "pump stop manual".to_string()]
        );
    }

    #[test]
    fn deactivating_inactive_source_is_a_no_op() {
        let (mut output, line, log) = output();

        assert!(!output.off(ActivationSource::ScheduleBand));
        assert_eq!(line.writes(), vec![false]);
        assert!(log.records().is_empty());
    }

    #[test]
    fn button_edges_drive_manual_source() {
        let (mut output, _line, _log) = output();

        output.activate(ActivationSource::Timer);
        assert!(!output.button_edge(Edge::Falling));
        assert!(output.sources().contains(ActivationSource::Manual));

        assert!(!output.button_edge(Edge::Rising));
        assert!(output.is_active());
        assert!(!output.sources().contains(ActivationSource::Manual));
    }

    #[test]
    fn release_all_turns_line_off() {
        let (mut output, line, _log) = output();
        output.on(ActivationSource::Manual);
        output.on(ActivationSource::Timer);

        assert!(output.release_all("retries exhausted"));
        assert!(!output.sources().any());
        assert_eq!(line.level(), false);
        assert!(!output.release_all("again"));
    }
}
