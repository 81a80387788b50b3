use glob::Pattern;
use keel_core::RuleMatch;
use regex::Regex;

use crate::{PermissionQuery, PolicyError};

/// Outcome of testing a single rule against a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RuleFit {
    Matches,
    Misses,
    /// The rule's own pattern does not compile; treated as a miss.
    Invalid(String),
}

pub(crate) fn rule_fits(matcher: &RuleMatch, query: &PermissionQuery) -> RuleFit {
    if let Some(tool) = &matcher.tool
        && tool != &query.tool
    {
        return RuleFit::Misses;
    }

    if let Some(glob) = &matcher.path_glob {
        let Some(path) = &query.path else {
            return RuleFit::Misses;
        };
        match Pattern::new(glob) {
            Ok(pattern) if pattern.matches(path) => {}
            Ok(_) => return RuleFit::Misses,
            Err(err) => return RuleFit::Invalid(format!("invalid pathGlob '{glob}': {err}")),
        }
    }

    if let Some(raw) = &matcher.command_pattern {
        let Some(command) = &query.command else {
            return RuleFit::Misses;
        };
        match Regex::new(raw) {
            Ok(re) if re.is_match(command) => {}
            Ok(_) => return RuleFit::Misses,
            Err(err) => {
                return RuleFit::Invalid(format!("invalid commandPattern '{raw}': {err}"));
            }
        }
    }

    RuleFit::Matches
}

/// Rejects rules whose patterns would never compile, before they are saved.
pub(crate) fn validate_rule(matcher: &RuleMatch) -> Result<(), PolicyError> {
    if let Some(glob) = &matcher.path_glob {
        Pattern::new(glob).map_err(|err| PolicyError::InvalidGlob {
            pattern: glob.clone(),
            message: err.to_string(),
        })?;
    }
    if let Some(raw) = &matcher.command_pattern {
        Regex::new(raw).map_err(|err| PolicyError::InvalidRegex {
            pattern: raw.clone(),
            message: err.to_string(),
        })?;
    }
    Ok(())
}
