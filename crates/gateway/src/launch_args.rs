//! Launch-Args Injector: rewrites a session's child-process
//! arguments so codex agents export OTLP telemetry back to this gateway,
//! and resolves the user's shell for terminal agents.

use std::net::SocketAddr;

use harness_protocol::AgentType;

/// The program + args actually handed to the `PtyFactory`, plus the
/// telemetry token minted for this launch (codex only).
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub token: Option<String>,
}

pub struct LaunchArgsInjector {
    telemetry_bind: SocketAddr,
    log_user_prompt: bool,
    history_persistence: bool,
}

impl LaunchArgsInjector {
    pub fn new(telemetry_bind: SocketAddr, log_user_prompt: bool, history_persistence: bool) -> Self {
        LaunchArgsInjector {
            telemetry_bind,
            log_user_prompt,
            history_persistence,
        }
    }

    pub fn build(&self, agent_type: AgentType, program: String, args: Vec<String>) -> LaunchPlan {
        match agent_type {
            AgentType::Codex => self.build_codex(program, args),
            AgentType::Terminal => LaunchPlan {
                program: harness_pty_process::resolve_terminal_command_for_environment(),
                args,
                token: None,
            },
            AgentType::Claude | AgentType::Cursor | AgentType::Critique => LaunchPlan {
                program,
                args,
                token: None,
            },
        }
    }

    fn build_codex(&self, program: String, mut args: Vec<String>) -> LaunchPlan {
        let token = harness_protocol::new_id();
        let exporter_url = format!(
            "http://{}:{}/v1/logs/{}",
            self.telemetry_bind.ip(),
            self.telemetry_bind.port(),
            urlencoding::encode(&token)
        );

        let mut otel_args = vec![
            "-c".to_string(),
            format!("otel.exporter=\"{exporter_url}\""),
            "-c".to_string(),
            format!("otel.log_user_prompt={}", self.log_user_prompt),
            "-c".to_string(),
            format!("history.persistence={}", self.history_persistence),
        ];
        otel_args.append(&mut args);

        LaunchPlan {
            program,
            args: otel_args,
            token: Some(token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn injector() -> LaunchArgsInjector {
        LaunchArgsInjector::new("127.0.0.1:8766".parse().unwrap(), true, true)
    }

    #[test]
    fn codex_gets_otel_exporter_flags_prepended() {
        let plan = injector().build(AgentType::Codex, "codex".into(), vec!["--resume".into()]);
        assert!(plan.token.is_some());
        assert_eq!(plan.args[0], "-c");
        assert!(plan.args[1].starts_with("otel.exporter="));
        assert_eq!(plan.args.last().unwrap(), "--resume");
    }

    #[test]
    fn claude_args_pass_through_verbatim() {
        let plan = injector().build(AgentType::Claude, "claude".into(), vec!["--continue".into()]);
        assert!(plan.token.is_none());
        assert_eq!(plan.args, vec!["--continue".to_string()]);
        assert_eq!(plan.program, "claude");
    }

    #[test]
    fn terminal_agent_resolves_shell_program() {
        let plan = injector().build(AgentType::Terminal, "ignored".into(), vec![]);
        assert!(plan.token.is_none());
        assert!(!plan.program.is_empty());
    }
}
