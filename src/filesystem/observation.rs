use std::path::PathBuf;

use colored::Colorize;
use derive_more::Display;

/// A structural change applied to the tree, reported for audit.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Observation {
    #[display("linked {} (ino {ino}, parent {parent_ino})", path.display())]
    Linked {
        path: PathBuf,
        ino: u64,
        parent_ino: u64,
    },
    #[display("unlinked {} (ino {ino}, parent {parent_ino})", path.display())]
    Unlinked {
        path: PathBuf,
        ino: u64,
        parent_ino: u64,
    },
}

pub trait ObservationSink {
    fn observe(&mut self, observation: &Observation);
}

/// Prints one audit line per observation to stdout.
#[derive(Debug, Clone)]
pub struct AuditPrinter {
    colored: bool,
}

impl AuditPrinter {
    pub fn stdout() -> Self {
        Self {
            colored: supports_color::on(supports_color::Stream::Stdout).is_some(),
        }
    }

    fn render(&self, observation: &Observation) -> String {
        let line = observation.to_string();
        if !self.colored {
            return line;
        }
        match observation {
            Observation::Linked { .. } => line.green().to_string(),
            Observation::Unlinked { .. } => line.red().to_string(),
        }
    }
}

impl ObservationSink for AuditPrinter {
    fn observe(&mut self, observation: &Observation) {
        println!("{}", self.render(observation));
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingSink;
