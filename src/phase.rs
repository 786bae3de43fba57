//! The fixed phase pipeline every recipe moves through.
//!
//! Phases are strictly ordered; a recipe's progress is a monotonic walk from
//! `None` to `Completion`. `None` is the "not started" sentinel and never has
//! a body.

use std::fmt;

use crate::error::ScriptError;

/// One step of the recipe pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    None = 0,
    RecipeFetch = 1,
    Check = 2,
    Fetch = 3,
    Stage = 4,
    Build = 5,
    Install = 6,
    Deploy = 7,
    Completion = 8,
}

impl Phase {
    /// All phases that have a body, in order.
    pub const PIPELINE: [Phase; 8] = [
        Phase::RecipeFetch,
        Phase::Check,
        Phase::Fetch,
        Phase::Stage,
        Phase::Build,
        Phase::Install,
        Phase::Deploy,
        Phase::Completion,
    ];

    /// The next phase after `self`, or `None` if the pipeline is finished.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::None => Some(Phase::RecipeFetch),
            Phase::RecipeFetch => Some(Phase::Check),
            Phase::Check => Some(Phase::Fetch),
            Phase::Fetch => Some(Phase::Stage),
            Phase::Stage => Some(Phase::Build),
            Phase::Build => Some(Phase::Install),
            Phase::Install => Some(Phase::Deploy),
            Phase::Deploy => Some(Phase::Completion),
            Phase::Completion => None,
        }
    }

    /// Stable script-visible name.
    pub fn name(self) -> &'static str {
        match self {
            Phase::None => "none",
            Phase::RecipeFetch => "recipe_fetch",
            Phase::Check => "check",
            Phase::Fetch => "fetch",
            Phase::Stage => "stage",
            Phase::Build => "build",
            Phase::Install => "install",
            Phase::Deploy => "deploy",
            Phase::Completion => "completion",
        }
    }

    /// Parse a phase name as written in recipe scripts (`needed_by` values).
    pub fn parse(s: &str) -> Result<Phase, ScriptError> {
        match s {
            "none" => Ok(Phase::None),
            "recipe_fetch" => Ok(Phase::RecipeFetch),
            "check" => Ok(Phase::Check),
            "fetch" => Ok(Phase::Fetch),
            "stage" => Ok(Phase::Stage),
            "build" => Ok(Phase::Build),
            "install" => Ok(Phase::Install),
            "deploy" => Ok(Phase::Deploy),
            "completion" => Ok(Phase::Completion),
            other => Err(ScriptError::UnknownPhase(other.to_string())),
        }
    }

    pub fn from_u8(v: u8) -> Phase {
        match v {
            1 => Phase::RecipeFetch,
            2 => Phase::Check,
            3 => Phase::Fetch,
            4 => Phase::Stage,
            5 => Phase::Build,
            6 => Phase::Install,
            7 => Phase::Deploy,
            8 => Phase::Completion,
            _ => Phase::None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_is_totally_ordered() {
        let mut prev = Phase::None;
        for phase in Phase::PIPELINE {
            assert!(prev < phase, "{prev} must precede {phase}");
            prev = phase;
        }
    }

    #[test]
    fn successor_walks_the_pipeline() {
        let mut cur = Phase::None;
        let mut seen = Vec::new();
        while let Some(next) = cur.successor() {
            seen.push(next);
            cur = next;
        }
        assert_eq!(seen, Phase::PIPELINE);
        assert_eq!(Phase::Completion.successor(), None);
    }

    #[test]
    fn parse_round_trips_names() {
        for phase in Phase::PIPELINE {
            assert_eq!(Phase::parse(phase.name()).unwrap(), phase);
        }
        assert!(Phase::parse("compile").is_err());
    }

    #[test]
    fn from_u8_matches_repr() {
        for phase in Phase::PIPELINE {
            assert_eq!(Phase::from_u8(phase as u8), phase);
        }
        assert_eq!(Phase::from_u8(0), Phase::None);
        assert_eq!(Phase::from_u8(200), Phase::None);
    }
}
