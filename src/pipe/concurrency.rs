//! Pipe concurrency rules.

use std::collections::HashMap;

use crate::stream::{AudioMode, RouteFlag};

/// Path class a stream's flag maps to, for concurrency decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum PipeType {
    NormalOut,
    LowLatencyOut,
    CallOut,
    DirectOut,
    Offload,
    Multichannel,
    NormalIn,
    LowLatencyIn,
    CallIn,
}

impl PipeType {
    /// Classifies a flag for the given direction.
    pub fn classify(flag: RouteFlag, mode: AudioMode) -> Self {
        match mode {
            AudioMode::Playback => {
                if flag.contains(RouteFlag::FAST) {
                    if flag.contains(RouteFlag::VOIP) {
                        Self::CallOut
                    } else {
                        Self::LowLatencyOut
                    }
                } else if flag.intersects(RouteFlag::DIRECT | RouteFlag::HD) {
                    if flag.contains(RouteFlag::VOIP) {
                        Self::CallOut
                    } else {
                        Self::DirectOut
                    }
                } else if flag.contains(RouteFlag::LOWPOWER) {
                    Self::Offload
                } else if flag.contains(RouteFlag::MULTICHANNEL) {
                    Self::Multichannel
                } else {
                    Self::NormalOut
                }
            }
            AudioMode::Record => {
                if flag.contains(RouteFlag::FAST) {
                    if flag.contains(RouteFlag::VOIP) {
                        Self::CallIn
                    } else {
                        Self::LowLatencyIn
                    }
                } else {
                    Self::NormalIn
                }
            }
        }
    }
}

/// What happens when an incoming stream meets an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConcurrencyAction {
    /// Both keep their paths.
    #[default]
    PlayBoth,
    /// The incoming stream falls back to the normal path.
    ConcedeIncoming,
    /// The existing stream falls back to the normal path and is recreated.
    ConcedeExisting,
}

/// Table of `(existing, incoming)` pipe type pairs to actions.
///
/// Pairs not in the table play both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyRules {
    rules: HashMap<(PipeType, PipeType), ConcurrencyAction>,
}

impl ConcurrencyRules {
    /// Creates a table where everything plays both.
    pub fn permissive() -> Self {
        Self { rules: HashMap::new() }
    }

    /// Sets the action for an `(existing, incoming)` pair.
    pub fn set(&mut self, existing: PipeType, incoming: PipeType, action: ConcurrencyAction) {
        self.rules.insert((existing, incoming), action);
    }

    /// Looks up the action for an `(existing, incoming)` pair.
    pub fn action(&self, existing: PipeType, incoming: PipeType) -> ConcurrencyAction {
        self.rules.get(&(existing, incoming)).copied().unwrap_or_default()
    }
}

impl Default for ConcurrencyRules {
    /// Low latency capture paths are exclusive: a newer fast or call
    /// capturer takes the path over from an older one.
    fn default() -> Self {
        let mut rules = Self::permissive();
        for existing in [PipeType::LowLatencyIn, PipeType::CallIn] {
            for incoming in [PipeType::LowLatencyIn, PipeType::CallIn] {
                rules.set(existing, incoming, ConcurrencyAction::ConcedeExisting);
            }
        }
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_output() {
        assert_eq!(PipeType::classify(RouteFlag::NORMAL, AudioMode::Playback), PipeType::NormalOut);
        assert_eq!(PipeType::classify(RouteFlag::FAST, AudioMode::Playback), PipeType::LowLatencyOut);
        assert_eq!(
            PipeType::classify(RouteFlag::FAST | RouteFlag::VOIP, AudioMode::Playback),
            PipeType::CallOut
        );
        assert_eq!(PipeType::classify(RouteFlag::LOWPOWER, AudioMode::Playback), PipeType::Offload);
        assert_eq!(PipeType::classify(RouteFlag::HD, AudioMode::Playback), PipeType::DirectOut);
    }

    #[test]
    fn test_classify_input() {
        assert_eq!(PipeType::classify(RouteFlag::FAST, AudioMode::Record), PipeType::LowLatencyIn);
        assert_eq!(PipeType::classify(RouteFlag::FAST | RouteFlag::VOIP, AudioMode::Record), PipeType::CallIn);
        assert_eq!(PipeType::classify(RouteFlag::VOIP, AudioMode::Record), PipeType::NormalIn);
    }

    #[test]
    fn test_default_rules() {
        let rules = ConcurrencyRules::default();
        assert_eq!(
            rules.action(PipeType::LowLatencyIn, PipeType::CallIn),
            ConcurrencyAction::ConcedeExisting
        );
        assert_eq!(
            rules.action(PipeType::NormalOut, PipeType::LowLatencyOut),
            ConcurrencyAction::PlayBoth
        );
    }
}
