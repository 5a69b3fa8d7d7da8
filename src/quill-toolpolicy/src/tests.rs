use std::path::PathBuf;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::engine::{PolicyCheckResult, PolicyEngine, PolicyEngineConfig, ToolCallRequest};
use crate::loader::load_policy_files;
use crate::pattern::{compile_pattern, prefix_to_pattern};
use crate::rule::{
    CheckerRef, MAX_RAW_PRIORITY, PolicyRule, RuleSource, SHELL_TOOL_NAME, SafetyCheckerRule, Tier,
};
use crate::update::{PolicyUpdateEvent, PolicyUpdater};
use crate::{ApprovalMode, PolicyDecision, PolicyFileErrorKind, PolicySettings, priorities};

fn prefix_rule(prefix: &str, decision: PolicyDecision, priority: f64) -> PolicyRule {
    PolicyRule {
        tool_name: Some(SHELL_TOOL_NAME.to_string()),
        args_pattern: Some(compile_pattern(&prefix_to_pattern(prefix)).unwrap()),
        decision,
        priority,
        modes: None,
        allow_redirection: false,
        source: RuleSource::Settings("test"),
        deny_message: None,
    }
}

fn tool_rule(tool: &str, decision: PolicyDecision, priority: f64) -> PolicyRule {
    PolicyRule {
        tool_name: Some(tool.to_string()),
        args_pattern: None,
        decision,
        priority,
        modes: None,
        allow_redirection: false,
        source: RuleSource::Settings("test"),
        deny_message: None,
    }
}

fn engine_with(rules: Vec<PolicyRule>, default_decision: PolicyDecision) -> PolicyEngine {
    PolicyEngine::new(PolicyEngineConfig {
        rules,
        default_decision,
        ..Default::default()
    })
}

fn check_shell(engine: &PolicyEngine, command: &str) -> PolicyCheckResult {
    engine.check(&ToolCallRequest::shell(command))
}

// ---------------------------------------------------------------------------
// Tiers and priorities
// ---------------------------------------------------------------------------

#[test]
fn higher_tier_outranks_any_sub_priority() {
    let tiers = [Tier::Default, Tier::User, Tier::Admin];
    for pair in tiers.windows(2) {
        assert!(pair[0].transform_priority(MAX_RAW_PRIORITY) < pair[1].transform_priority(0));
    }
}

#[test]
fn admin_deny_beats_maximal_user_allow() {
    let engine = engine_with(
        vec![
            tool_rule(
                "browser",
                PolicyDecision::Allow,
                Tier::User.transform_priority(MAX_RAW_PRIORITY),
            ),
            tool_rule(
                "browser",
                PolicyDecision::Deny,
                Tier::Admin.transform_priority(0),
            ),
        ],
        PolicyDecision::AskUser,
    );
    let result = engine.check(&ToolCallRequest {
        tool_name: "browser".to_string(),
        args: serde_json::json!({}),
    });
    assert_eq!(result.decision, PolicyDecision::Deny);
}

#[test]
fn equal_priority_keeps_the_first_rule() {
    let priority = Tier::User.transform_priority(100);
    let engine = engine_with(
        vec![
            tool_rule("read_file", PolicyDecision::Allow, priority),
            tool_rule("read_file", PolicyDecision::Deny, priority),
        ],
        PolicyDecision::AskUser,
    );
    let result = engine.check(&ToolCallRequest {
        tool_name: "read_file".to_string(),
        args: serde_json::json!({"path": "x"}),
    });
    assert_eq!(result.decision, PolicyDecision::Allow);
}

#[test]
fn unmatched_tool_gets_the_default_decision() {
    let engine = engine_with(Vec::new(), PolicyDecision::AskUser);
    let result = engine.check(&ToolCallRequest {
        tool_name: "write_file".to_string(),
        args: serde_json::json!({}),
    });
    assert_eq!(result.decision, PolicyDecision::AskUser);
    assert!(result.rule.is_none());
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[test]
fn mcp_wildcard_matches_every_tool_of_the_server() {
    let engine = engine_with(
        vec![tool_rule(
            "github__*",
            PolicyDecision::Deny,
            Tier::User.transform_priority(0),
        )],
        PolicyDecision::AskUser,
    );
    let denied = engine.check(&ToolCallRequest {
        tool_name: "github__create_issue".to_string(),
        args: serde_json::json!({}),
    });
    assert_eq!(denied.decision, PolicyDecision::Deny);

    let other = engine.check(&ToolCallRequest {
        tool_name: "gitlab__create_issue".to_string(),
        args: serde_json::json!({}),
    });
    assert_eq!(other.decision, PolicyDecision::AskUser);
}

#[test]
fn rule_without_tool_name_matches_any_tool() {
    let mut rule = tool_rule("x", PolicyDecision::Deny, Tier::Admin.transform_priority(0));
    rule.tool_name = None;
    let engine = engine_with(vec![rule], PolicyDecision::AskUser);
    let result = engine.check(&ToolCallRequest {
        tool_name: "anything".to_string(),
        args: serde_json::json!({}),
    });
    assert_eq!(result.decision, PolicyDecision::Deny);
}

#[test]
fn mode_scoped_rule_is_inert_in_other_modes() {
    let mut rule = tool_rule(
        "read_file",
        PolicyDecision::Allow,
        Tier::User.transform_priority(0),
    );
    rule.modes = Some(vec![ApprovalMode::Yolo]);
    let engine = engine_with(vec![rule], PolicyDecision::AskUser);

    let request = ToolCallRequest {
        tool_name: "read_file".to_string(),
        args: serde_json::json!({}),
    };
    assert_eq!(
        engine.check_in_mode(&request, ApprovalMode::Default).decision,
        PolicyDecision::AskUser,
    );
    assert_eq!(
        engine.check_in_mode(&request, ApprovalMode::Yolo).decision,
        PolicyDecision::Allow,
    );
}

#[test]
fn prefix_rules_respect_word_boundaries() {
    let engine = engine_with(
        vec![prefix_rule(
            "git log",
            PolicyDecision::Allow,
            Tier::User.transform_priority(100),
        )],
        PolicyDecision::AskUser,
    );
    assert_eq!(check_shell(&engine, "git log").decision, PolicyDecision::Allow);
    assert_eq!(
        check_shell(&engine, "git log --oneline").decision,
        PolicyDecision::Allow,
    );
    assert_eq!(
        check_shell(&engine, "git logout").decision,
        PolicyDecision::AskUser,
    );
}

#[test]
fn canonical_args_for_shell_is_the_command_text() {
    let request = ToolCallRequest::shell("git log");
    assert_eq!(request.canonical_args(), "git log");
}

#[test]
fn canonical_args_for_structured_args_is_their_json() {
    let request = ToolCallRequest {
        tool_name: "write_file".to_string(),
        args: serde_json::json!({"path": "/tmp/x"}),
    };
    assert_eq!(request.canonical_args(), r#"{"path":"/tmp/x"}"#);

    let plain = ToolCallRequest {
        tool_name: "web_fetch".to_string(),
        args: serde_json::Value::String("https://example.com".to_string()),
    };
    assert_eq!(plain.canonical_args(), "https://example.com");
}

// ---------------------------------------------------------------------------
// Shell decomposition
// ---------------------------------------------------------------------------

#[test]
fn compound_command_needs_every_part_allowed() {
    let engine = engine_with(
        vec![prefix_rule(
            "git log",
            PolicyDecision::Allow,
            Tier::User.transform_priority(100),
        )],
        PolicyDecision::AskUser,
    );
    for command in [
        "git log && rm -rf /",
        "git log; rm -rf /",
        "git log || rm -rf /",
        "git log | rm -rf /",
        "git log & rm -rf /",
    ] {
        let result = check_shell(&engine, command);
        assert_eq!(result.decision, PolicyDecision::AskUser, "{command}");
        assert!(result.rule.is_none(), "{command}");
    }
}

#[test]
fn compound_command_of_allowed_parts_is_allowed() {
    let engine = engine_with(
        vec![
            prefix_rule("git log", PolicyDecision::Allow, Tier::User.transform_priority(100)),
            prefix_rule("git status", PolicyDecision::Allow, Tier::User.transform_priority(100)),
        ],
        PolicyDecision::AskUser,
    );
    let result = check_shell(&engine, "git log && git status");
    assert_eq!(result.decision, PolicyDecision::Allow);
    assert!(result.rule.is_some());
}

#[test]
fn command_substitution_is_evaluated_separately() {
    let engine = engine_with(
        vec![prefix_rule(
            "git log",
            PolicyDecision::Allow,
            Tier::User.transform_priority(100),
        )],
        PolicyDecision::AskUser,
    );
    let result = check_shell(&engine, "git log $(rm -rf /)");
    assert_eq!(result.decision, PolicyDecision::AskUser);
    assert!(result.rule.is_none());
}

#[test]
fn deny_on_any_part_dominates_and_is_attributed() {
    let engine = engine_with(
        vec![
            prefix_rule("git log", PolicyDecision::Allow, Tier::User.transform_priority(100)),
            prefix_rule("rm -rf", PolicyDecision::Deny, Tier::User.transform_priority(100)),
        ],
        PolicyDecision::AskUser,
    );
    let result = check_shell(&engine, "git log && rm -rf /");
    assert_eq!(result.decision, PolicyDecision::Deny);
    let rule = result.rule.unwrap();
    assert_eq!(rule.decision, PolicyDecision::Deny);
}

#[test]
fn explicit_ask_keeps_attribution_until_a_default_ask_appears() {
    let engine = engine_with(
        vec![
            prefix_rule("git push", PolicyDecision::AskUser, Tier::User.transform_priority(100)),
            prefix_rule("git status", PolicyDecision::Allow, Tier::User.transform_priority(100)),
        ],
        PolicyDecision::AskUser,
    );
    // every part covered by a rule: the explicit ASK rule is reported
    let attributed = check_shell(&engine, "git status && git push origin");
    assert_eq!(attributed.decision, PolicyDecision::AskUser);
    assert!(attributed.rule.is_some());

    // an uncovered part means the default decision applied somewhere,
    // which no rule should take credit for
    let cleared = check_shell(&engine, "git push origin && unknowncmd");
    assert_eq!(cleared.decision, PolicyDecision::AskUser);
    assert!(cleared.rule.is_none());
}

#[test]
fn unparseable_commands_fail_closed() {
    let engine = engine_with(Vec::new(), PolicyDecision::AskUser);
    for command in [
        "cat <<EOF",
        "echo $((1+2))",
        "echo 'unterminated",
        "a &&& b",
        "",
    ] {
        let result = check_shell(&engine, command);
        assert_eq!(result.decision, PolicyDecision::AskUser, "{command:?}");
        assert!(result.rule.is_none(), "{command:?}");
    }
}

#[test]
fn fail_closed_becomes_deny_when_the_default_is_deny() {
    let engine = engine_with(Vec::new(), PolicyDecision::Deny);
    let result = check_shell(&engine, "cat <<EOF");
    assert_eq!(result.decision, PolicyDecision::Deny);
}

#[test]
fn redirection_downgrades_allow_to_ask() {
    let engine = engine_with(
        vec![prefix_rule(
            "git log",
            PolicyDecision::Allow,
            Tier::User.transform_priority(100),
        )],
        PolicyDecision::AskUser,
    );
    let result = check_shell(&engine, "git log > out.txt");
    assert_eq!(result.decision, PolicyDecision::AskUser);
    // the downgrade keeps the rule for the prompt's explanation
    assert!(result.rule.is_some());
}

#[test]
fn allow_redirection_suppresses_the_downgrade() {
    let mut rule = prefix_rule(
        "git log",
        PolicyDecision::Allow,
        Tier::User.transform_priority(100),
    );
    rule.allow_redirection = true;
    let engine = engine_with(vec![rule], PolicyDecision::AskUser);
    let result = check_shell(&engine, "git log > out.txt");
    assert_eq!(result.decision, PolicyDecision::Allow);
}

#[test]
fn process_substitution_is_not_treated_as_redirection() {
    let engine = engine_with(
        vec![
            prefix_rule("diff", PolicyDecision::Allow, Tier::User.transform_priority(100)),
            prefix_rule("git log", PolicyDecision::Allow, Tier::User.transform_priority(100)),
            prefix_rule("git show", PolicyDecision::Allow, Tier::User.transform_priority(100)),
        ],
        PolicyDecision::AskUser,
    );
    let result = check_shell(&engine, "diff <(git log) <(git show)");
    assert_eq!(result.decision, PolicyDecision::Allow);
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

fn write_policy(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn loads_rules_and_expands_prefix_lists() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(
        &dir,
        "base.toml",
        r#"
            [[rule]]
            tool_name = "shell"
            command_prefix = ["git log", "git status"]
            decision = "allow"
            priority = 100

            [[rule]]
            tool_name = "read_file"
            decision = "allow"
            priority = 50
        "#,
    );
    let outcome = load_policy_files(&[(dir.path().to_path_buf(), Tier::User)]);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.rules.len(), 3);
    assert!(outcome
        .rules
        .iter()
        .all(|rule| rule.priority > 2.0 && rule.priority < 3.0));
}

#[test]
fn reload_of_the_same_inputs_is_identical() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(
        &dir,
        "b.toml",
        "[[rule]]\ntool_name = \"shell\"\ncommand_prefix = \"ls\"\ndecision = \"allow\"\npriority = 10\n",
    );
    write_policy(
        &dir,
        "a.toml",
        "[[rule]]\ntool_name = \"read_file\"\ndecision = \"allow\"\npriority = 20\n",
    );
    let paths = [(dir.path().to_path_buf(), Tier::User)];
    let first = load_policy_files(&paths);
    let second = load_policy_files(&paths);
    let describe = |outcome: &crate::LoadOutcome| {
        outcome
            .rules
            .iter()
            .map(|rule| (rule.tool_name.clone(), rule.priority.to_bits()))
            .collect::<Vec<_>>()
    };
    assert_eq!(describe(&first), describe(&second));
    // a.toml sorts before b.toml
    assert_eq!(first.rules[0].tool_name.as_deref(), Some("read_file"));
}

#[test]
fn missing_paths_are_not_errors() {
    let outcome = load_policy_files(&[(PathBuf::from("/nonexistent/quill/policies"), Tier::Admin)]);
    assert!(outcome.errors.is_empty());
    assert!(outcome.rules.is_empty());
}

#[test]
fn invalid_toml_is_reported_not_raised() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(&dir, "broken.toml", "not [ valid = toml");
    let outcome = load_policy_files(&[(dir.path().to_path_buf(), Tier::User)]);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, PolicyFileErrorKind::TomlParse);
    assert_eq!(outcome.errors[0].file_name, "broken.toml");
}

#[test]
fn unknown_top_level_keys_are_schema_errors() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(&dir, "odd.toml", "[settings]\nfoo = 1\n");
    let outcome = load_policy_files(&[(dir.path().to_path_buf(), Tier::User)]);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, PolicyFileErrorKind::SchemaValidation);
}

#[test]
fn missing_required_fields_are_schema_errors_with_rule_index() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(
        &dir,
        "p.toml",
        r#"
            [[rule]]
            tool_name = "read_file"
            decision = "allow"
            priority = 1

            [[rule]]
            tool_name = "shell"
            decision = "allow"
        "#,
    );
    let outcome = load_policy_files(&[(dir.path().to_path_buf(), Tier::User)]);
    assert_eq!(outcome.rules.len(), 1);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, PolicyFileErrorKind::SchemaValidation);
    assert_eq!(outcome.errors[0].rule_index, Some(1));
}

#[test]
fn out_of_range_priority_is_a_rule_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(
        &dir,
        "p.toml",
        "[[rule]]\ntool_name = \"read_file\"\ndecision = \"allow\"\npriority = 1000\n",
    );
    let outcome = load_policy_files(&[(dir.path().to_path_buf(), Tier::User)]);
    assert!(outcome.rules.is_empty());
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, PolicyFileErrorKind::RuleValidation);
}

#[test]
fn shorthand_on_a_non_shell_tool_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(
        &dir,
        "p.toml",
        "[[rule]]\ntool_name = \"read_file\"\ncommand_prefix = \"git\"\ndecision = \"allow\"\npriority = 1\n",
    );
    let outcome = load_policy_files(&[(dir.path().to_path_buf(), Tier::User)]);
    assert!(outcome.rules.is_empty());
    assert_eq!(outcome.errors[0].kind, PolicyFileErrorKind::RuleValidation);
}

#[test]
fn exclusive_pattern_fields_cannot_be_combined() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(
        &dir,
        "p.toml",
        "[[rule]]\ntool_name = \"shell\"\ncommand_prefix = \"git\"\nargs_pattern = \"x\"\ndecision = \"allow\"\npriority = 1\n",
    );
    let outcome = load_policy_files(&[(dir.path().to_path_buf(), Tier::User)]);
    assert!(outcome.rules.is_empty());
    assert_eq!(outcome.errors[0].kind, PolicyFileErrorKind::RuleValidation);
}

#[test]
fn bad_regex_drops_only_the_offending_expansion() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(
        &dir,
        "p.toml",
        r#"
            [[rule]]
            tool_name = "shell"
            command_regex = "(a+)+"
            decision = "allow"
            priority = 1

            [[rule]]
            tool_name = "read_file"
            decision = "allow"
            priority = 1
        "#,
    );
    let outcome = load_policy_files(&[(dir.path().to_path_buf(), Tier::User)]);
    assert_eq!(outcome.rules.len(), 1);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, PolicyFileErrorKind::RegexCompilation);
}

#[test]
fn mcp_name_expands_tool_names() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(
        &dir,
        "p.toml",
        r#"
            [[rule]]
            mcp_name = "github"
            tool_name = ["create_issue", "merge_pr"]
            decision = "ask_user"
            priority = 5

            [[rule]]
            mcp_name = "slack"
            decision = "deny"
            priority = 5
        "#,
    );
    let outcome = load_policy_files(&[(dir.path().to_path_buf(), Tier::User)]);
    assert!(outcome.errors.is_empty());
    let names: Vec<_> = outcome
        .rules
        .iter()
        .map(|rule| rule.tool_name.as_deref().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["github__create_issue", "github__merge_pr", "slack__*"]);
}

#[test]
fn camel_case_aliases_are_accepted() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(
        &dir,
        "p.toml",
        r#"
            [[rule]]
            toolName = "shell"
            commandPrefix = "git log"
            decision = "allow"
            priority = 1
        "#,
    );
    let outcome = load_policy_files(&[(dir.path().to_path_buf(), Tier::User)]);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.rules.len(), 1);
}

#[test]
fn safety_checkers_are_loaded_alongside_rules() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(
        &dir,
        "p.toml",
        r#"
            [[safety_checker]]
            tool_name = "write_file"
            priority = 50
            checker = { type = "in-process", name = "path_guard", required_context = ["cwd"] }
        "#,
    );
    let outcome = load_policy_files(&[(dir.path().to_path_buf(), Tier::User)]);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.checkers.len(), 1);
    assert_eq!(outcome.checkers[0].checker.name(), "path_guard");
    assert_eq!(outcome.checkers[0].checker.required_context(), ["cwd"]);
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

fn assembled_engine(settings: &PolicySettings) -> PolicyEngine {
    let (config, errors) = crate::assemble(crate::LoadOutcome::default(), settings);
    assert!(errors.is_empty());
    PolicyEngine::new(config)
}

#[test]
fn settings_lists_become_rules_at_fixed_priorities() {
    let settings = PolicySettings {
        allowed_tools: vec!["read_file".to_string()],
        excluded_tools: vec!["browser".to_string()],
        allowed_mcp_servers: vec!["github".to_string()],
        excluded_mcp_servers: vec!["slack".to_string()],
        trusted_mcp_servers: vec!["linear".to_string()],
        ..Default::default()
    };
    let (config, errors) = crate::assemble(crate::LoadOutcome::default(), &settings);
    assert!(errors.is_empty());

    let priority_of = |tool: &str| {
        config
            .rules
            .iter()
            .find(|rule| rule.tool_name.as_deref() == Some(tool))
            .map(|rule| rule.priority)
            .unwrap()
    };
    assert_eq!(priority_of("read_file"), priorities::ALLOWED_TOOL);
    assert_eq!(priority_of("browser"), priorities::EXCLUDED_TOOL);
    assert_eq!(priority_of("github__*"), priorities::ALLOWED_MCP_SERVER);
    assert_eq!(priority_of("slack__*"), priorities::EXCLUDED_MCP_SERVER);
    assert_eq!(priority_of("linear__*"), priorities::TRUSTED_MCP_SERVER);
}

#[test]
fn exclusion_beats_allowance_for_the_same_tool() {
    let settings = PolicySettings {
        allowed_tools: vec!["browser".to_string()],
        excluded_tools: vec!["browser".to_string()],
        ..Default::default()
    };
    let engine = assembled_engine(&settings);
    let result = engine.check(&ToolCallRequest {
        tool_name: "browser".to_string(),
        args: serde_json::json!({}),
    });
    assert_eq!(result.decision, PolicyDecision::Deny);
}

#[test]
fn legacy_shell_shorthand_allows_the_prefix() {
    let settings = PolicySettings {
        allowed_tools: vec!["shell(git log)".to_string()],
        ..Default::default()
    };
    let engine = assembled_engine(&settings);
    assert_eq!(
        check_shell(&engine, "git log --oneline").decision,
        PolicyDecision::Allow,
    );
    assert_eq!(check_shell(&engine, "git push").decision, PolicyDecision::AskUser);
}

#[test]
fn settings_default_decision_reaches_the_engine() {
    let settings = PolicySettings {
        default_decision: PolicyDecision::Deny,
        ..Default::default()
    };
    let engine = assembled_engine(&settings);
    let result = engine.check(&ToolCallRequest {
        tool_name: "anything".to_string(),
        args: serde_json::json!({}),
    });
    assert_eq!(result.decision, PolicyDecision::Deny);
}

// ---------------------------------------------------------------------------
// Safety checkers
// ---------------------------------------------------------------------------

#[test]
fn checkers_are_selected_by_tool_and_sorted_by_priority() {
    let checker = |tool: Option<&str>, priority: f64, name: &str| SafetyCheckerRule {
        tool_name: tool.map(str::to_string),
        args_pattern: None,
        priority,
        modes: None,
        checker: CheckerRef::InProcess {
            name: name.to_string(),
            required_context: Vec::new(),
            config: None,
        },
    };
    let engine = PolicyEngine::new(PolicyEngineConfig {
        checkers: vec![
            checker(Some("write_file"), Tier::User.transform_priority(10), "low"),
            checker(None, Tier::Admin.transform_priority(0), "global"),
            checker(Some("read_file"), Tier::User.transform_priority(999), "other"),
        ],
        ..Default::default()
    });

    let selected: Vec<_> = engine
        .checkers_for("write_file", ApprovalMode::Default)
        .iter()
        .map(|rule| rule.checker.name().to_string())
        .collect();
    assert_eq!(selected, vec!["global", "low"]);
}

// ---------------------------------------------------------------------------
// Runtime grants and persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn grant_takes_effect_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine_with(Vec::new(), PolicyDecision::AskUser));
    let updater = PolicyUpdater::new(Arc::clone(&engine), dir.path().join("auto.toml"));

    assert_eq!(check_shell(&engine, "git log").decision, PolicyDecision::AskUser);
    updater.apply(&PolicyUpdateEvent::shell_prefixes(
        vec!["git log".to_string()],
        false,
    ));
    let result = check_shell(&engine, "git log --graph");
    assert_eq!(result.decision, PolicyDecision::Allow);
    assert_eq!(
        result.rule.unwrap().source,
        crate::RuleSource::RuntimeGrant,
    );
}

#[tokio::test]
async fn grant_never_overrides_an_admin_deny() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine_with(
        vec![prefix_rule(
            "rm -rf",
            PolicyDecision::Deny,
            Tier::Admin.transform_priority(0),
        )],
        PolicyDecision::AskUser,
    ));
    let updater = PolicyUpdater::new(Arc::clone(&engine), dir.path().join("auto.toml"));
    updater.apply(&PolicyUpdateEvent::shell_prefixes(
        vec!["rm -rf".to_string()],
        false,
    ));
    assert_eq!(check_shell(&engine, "rm -rf /tmp/x").decision, PolicyDecision::Deny);
}

#[tokio::test]
async fn persisted_grant_reloads_at_the_grant_priority() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("auto_approved.toml");
    let engine = Arc::new(engine_with(Vec::new(), PolicyDecision::AskUser));
    let updater = PolicyUpdater::new(Arc::clone(&engine), path.clone());

    updater.apply(&PolicyUpdateEvent::shell_prefixes(
        vec!["git log".to_string()],
        true,
    ));
    updater.flush().await;

    let outcome = load_policy_files(&[(path, Tier::User)]);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.rules.len(), 1);
    assert!((outcome.rules[0].priority - priorities::RUNTIME_GRANT).abs() < 1e-9);
    assert_eq!(outcome.rules[0].decision, PolicyDecision::Allow);
    assert!(outcome.rules[0].args_match("git log --stat"));
    assert!(!outcome.rules[0].args_match("git push"));

    // the atomic write never leaves scratch files behind
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| {
            entry.path().extension().and_then(|ext| ext.to_str()) == Some("tmp")
        })
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn grants_append_to_the_saved_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("auto.toml");
    let engine = Arc::new(engine_with(Vec::new(), PolicyDecision::AskUser));
    let updater = PolicyUpdater::new(Arc::clone(&engine), path.clone());

    updater.apply(&PolicyUpdateEvent::shell_prefixes(vec!["ls".to_string()], true));
    updater.apply(&PolicyUpdateEvent::tool("read_file", true));
    updater.flush().await;

    let outcome = load_policy_files(&[(path, Tier::User)]);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.rules.len(), 2);
}

#[tokio::test]
async fn corrupt_saved_file_is_replaced_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("auto.toml");
    std::fs::write(&path, "not [ valid = toml").unwrap();

    let engine = Arc::new(engine_with(Vec::new(), PolicyDecision::AskUser));
    let updater = PolicyUpdater::new(Arc::clone(&engine), path.clone());
    updater.apply(&PolicyUpdateEvent::shell_prefixes(vec!["ls".to_string()], true));
    updater.flush().await;

    let outcome = load_policy_files(&[(path, Tier::User)]);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.rules.len(), 1);
}

#[tokio::test]
async fn broadcast_subscription_applies_grants() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine_with(Vec::new(), PolicyDecision::AskUser));
    let updater = Arc::new(PolicyUpdater::new(
        Arc::clone(&engine),
        dir.path().join("auto.toml"),
    ));

    let (tx, rx) = tokio::sync::broadcast::channel(16);
    let handle = Arc::clone(&updater).subscribe(rx);
    tx.send(PolicyUpdateEvent::tool("read_file", false)).unwrap();
    drop(tx);
    handle.await.unwrap();

    let result = engine.check(&ToolCallRequest {
        tool_name: "read_file".to_string(),
        args: serde_json::json!({}),
    });
    assert_eq!(result.decision, PolicyDecision::Allow);
}

#[tokio::test]
async fn unusable_grant_pattern_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine_with(Vec::new(), PolicyDecision::AskUser));
    let updater = PolicyUpdater::new(Arc::clone(&engine), dir.path().join("auto.toml"));
    updater.apply(&PolicyUpdateEvent {
        tool_name: Some(SHELL_TOOL_NAME.to_string()),
        mcp_name: None,
        command_prefix: None,
        args_pattern: Some("(a+)+".to_string()),
        persist: true,
    });
    updater.flush().await;
    assert!(engine.snapshot_rules().is_empty());
}
