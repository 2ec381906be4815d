//! Shared keyword vocabularies. Every pattern is matched against lower-cased
//! text.

use std::sync::OnceLock;

use regex::Regex;

macro_rules! vocabulary {
    ($($(#[$meta:meta])* $name:ident => $pattern:expr;)+) => {
        $(
            $(#[$meta])*
            pub(crate) fn $name() -> &'static Regex {
                static PATTERN: OnceLock<Regex> = OnceLock::new();
                PATTERN.get_or_init(|| Regex::new($pattern).expect("vocabulary pattern compiles"))
            }
        )+
    };
}

vocabulary! {
    error => r"error|failed|failure|exception|fatal|timeout|timed out";
    success => r"completed|succeeded|passed|success";
    /// Status words on a finished work item that mean it did not land.
    item_failure => r"failed|failure|error|declined|aborted|timeout";
    item_success => r"completed|success|succeeded|passed";
    approval => r"approval_required|approval required|requires approval|needs approval|awaiting approval|requestapproval|request_approval|permission request|needs review|awaiting review|human review";
    stall => r"\bblocked\b|\bstalled\b|\bstall\b|no progress|no-progress|\bstuck\b|waiting for input";
    started_tag => r"turn\.started|turn_started|step\.started|step_started|run\.started|session\.started|conversation\.started|agent\.started";
    ended_tag => r"turn\.ended|turn\.completed|turn\.finished|step\.ended|step\.completed|run\.ended|run\.completed|session\.ended|agent\.completed|finished|\bdone\b";
    tool_tag => r"turn\.started|tool|exec|run";
    dependency => r"waiting (?:for|on)|dependency|dependencies|lock file|lockfile|\block\b|\blocked\b|resource busy|could not resolve|npm install|pip install|cargo fetch|downloading";
    verify => r"\b(?:test|tests|testing|pytest|jest|vitest|verify|verification|assert|assertion|lint|typecheck|tsc)\b";
    tool_read => r"\b(?:read|grep|glob|search|fetch)\b";
    tool_edit => r"\b(?:write|edit|patch|replace|multi_edit)\b";
    tool_bash => r"\b(?:bash|shell|terminal|command|exec)\b";
    file_extension => r"(?i)\.[a-z0-9]+$";
    file_path => r"(?i)([\w./-]+\.(?:tsx|ts|jsx|js|mjs|cjs|py|go|java|rs|md|json|yml|yaml|toml|sql|cpp|c|h))\b";
    whitespace => r"\s+";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_path_prefers_full_extension() {
        let found: Vec<_> = file_path()
            .captures_iter("wrote config.json and src/app.tsx")
            .map(|caps| caps[1].to_string())
            .collect();
        assert_eq!(found, vec!["config.json", "src/app.tsx"]);
    }

    #[test]
    fn stall_words_need_boundaries() {
        assert!(stall().is_match("agent is blocked on input"));
        assert!(!stall().is_match("unblockedness"));
        assert!(!dependency().is_match("unblocked"));
    }
}
