use crate::error::ConfigError;

/// Topic level separator.
pub const SEPARATOR: char = '/';
/// Single-level wildcard.
pub const SINGLE_LEVEL: &str = "+";
/// Multi-level wildcard.
pub const MULTI_LEVEL: &str = "#";

/// Check if an MQTT topic filter matches a topic name.
///
/// - `+` matches exactly one level
/// - `#` matches zero or more trailing levels (must be last)
/// - topics starting with `$` are never matched by a leading wildcard
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split(SEPARATOR);
    let mut topic_levels = topic.split(SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a subscription filter.
pub fn validate_filter(filter: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTemplate {
        template: filter.to_string(),
        reason: reason.to_string(),
    };

    if filter.is_empty() {
        return Err(invalid("filter is empty"));
    }
    if filter.contains('\0') {
        return Err(invalid("filter contains a NUL character"));
    }

    let levels: Vec<&str> = filter.split(SEPARATOR).collect();
    let last = levels.len() - 1;
    for (idx, level) in levels.iter().enumerate() {
        if *level == MULTI_LEVEL {
            if idx != last {
                return Err(invalid("'#' must be the last level"));
            }
            continue;
        }
        if *level == SINGLE_LEVEL {
            continue;
        }
        if level.contains('#') || level.contains('+') {
            return Err(invalid("wildcards must occupy a whole level"));
        }
    }

    Ok(())
}

/// Validate a topic name: non-empty, no wildcards, no NUL.
pub fn validate_topic(topic: &str) -> Result<(), ConfigError> {
    let reason = if topic.is_empty() {
        "topic name is empty"
    } else if topic.contains(['+', '#']) {
        "topic names cannot contain wildcards"
    } else if topic.contains('\0') {
        "topic name contains NUL"
    } else {
        return Ok(());
    };
    Err(ConfigError::InvalidSetting {
        field: "topic".to_string(),
        reason: reason.to_string(),
    })
}
