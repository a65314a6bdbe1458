use which::which;

/// Tools from `names` that are not on PATH.
pub fn missing_tools<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut missing = Vec::new();

    for tool in names {
        let tool = tool.as_ref().trim();
        if tool.is_empty() {
            continue;
        }
        match which(tool) {
            Ok(path) => {
                tracing::debug!("Found {}: {:?}", tool, path);
            }
            Err(_) => {
                missing.push(tool.to_string());
            }
        }
    }

    missing
}

/// Warn about, but do not fail on, tools a skill declares it shells out to.
pub fn warn_missing(skill: &str, tools: &[String]) {
    let missing = missing_tools(tools);
    if !missing.is_empty() {
        tracing::warn!(
            "Skill {} declares tools not found on PATH: {}",
            skill,
            missing.join(", ")
        );
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tools() {
        let missing = missing_tools(["sh", "definitely-not-a-real-tool-7f3a", ""]);
        assert_eq!(missing, vec!["definitely-not-a-real-tool-7f3a"]);
    }
}
