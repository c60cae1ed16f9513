// =============================================================================
// Tool Registry — the MCP-facing contract surface
// =============================================================================
//
// The session and game primitives are exposed as callable tools, filtered by
// namespace prefix.  Only the registry and its filtering semantics live in
// the core: when the requested prefix list does not include `bbs_`, the core
// session tools are not registered at all.  The wire protocol that serves
// this registry is an external collaborator.
// =============================================================================

use serde::Serialize;

/// One callable tool: name, contract summary, and its parameter sketch.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<&'static str>,
}

impl ToolSpec {
    fn new(name: &str, description: &str, parameters: Vec<&'static str>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Build every tool the engine can expose.
pub fn all_tools() -> Vec<ToolSpec> {
    vec![
        // ── Core session tools (bbs_) ───────────────────────────────────
        ToolSpec::new(
            "bbs_connect",
            "Open a telnet session to a BBS and return its session id",
            vec!["host", "port", "term_name", "cols", "rows"],
        ),
        ToolSpec::new(
            "bbs_read",
            "Read from a session: returns the screen snapshot and any detected prompt",
            vec!["session_id", "timeout_ms", "max_bytes"],
        ),
        ToolSpec::new(
            "bbs_send",
            "Send keystrokes to a session",
            vec!["session_id", "keys"],
        ),
        ToolSpec::new(
            "bbs_wait_for_prompt",
            "Read until a prompt (optionally a specific one) is detected",
            vec!["session_id", "prompt_id", "timeout_ms"],
        ),
        ToolSpec::new(
            "bbs_set_keepalive",
            "Configure the idle keepalive for a session",
            vec!["session_id", "interval_ms", "keys"],
        ),
        ToolSpec::new(
            "bbs_close",
            "Close a session",
            vec!["session_id"],
        ),
        // ── Game tools (tw2002_) ────────────────────────────────────────
        ToolSpec::new(
            "tw2002_game_state",
            "Current derived game state for a bot session",
            vec!["session_id"],
        ),
        ToolSpec::new(
            "tw2002_screen_analysis",
            "Structured analysis of the current screen: matches, partials, KV data",
            vec!["session_id"],
        ),
        ToolSpec::new(
            "tw2002_move",
            "Warp to an adjacent sector through the step machine",
            vec!["session_id", "to_sector"],
        ),
        ToolSpec::new(
            "tw2002_trade",
            "Dock and run one buy/sell through the haggle loop",
            vec!["session_id", "kind", "commodity"],
        ),
    ]
}

/// Filter the registry by namespace prefixes.  Core `bbs_` tools register
/// only when the list names the `bbs_` prefix; an empty list means
/// everything.
pub fn filter_tools(prefixes: &[String]) -> Vec<ToolSpec> {
    let all = all_tools();
    if prefixes.is_empty() {
        return all;
    }
    all.into_iter()
        .filter(|tool| prefixes.iter().any(|p| tool.name.starts_with(p.as_str())))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prefix_list_registers_everything() {
        let tools = filter_tools(&[]);
        assert_eq!(tools.len(), all_tools().len());
    }

    #[test]
    fn without_bbs_prefix_core_tools_are_absent() {
        let tools = filter_tools(&["tw2002_".to_string()]);
        assert!(!tools.is_empty());
        assert!(tools.iter().all(|t| t.name.starts_with("tw2002_")));
        assert!(!tools.iter().any(|t| t.name.starts_with("bbs_")));
    }

    #[test]
    fn bbs_prefix_registers_session_tools() {
        let tools = filter_tools(&["bbs_".to_string()]);
        assert!(tools.iter().any(|t| t.name == "bbs_connect"));
        assert!(tools.iter().any(|t| t.name == "bbs_read"));
        assert!(!tools.iter().any(|t| t.name.starts_with("tw2002_")));
    }

    #[test]
    fn unknown_prefix_registers_nothing() {
        assert!(filter_tools(&["mud_".to_string()]).is_empty());
    }
}
