// =============================================================================
// AIStrategy — LLM-chosen actions with a rule-based safety net
// =============================================================================
//
// Builds a structured context (game state summary, recent decisions, the
// action contract list, optional goal context), asks the provider for a JSON
// decision, and validates it.  Any parse/validation failure increments a
// consecutive-failure counter; at the threshold the strategy switches to its
// fallback for a fixed number of turns before retrying the LLM.
//
// Every call and every failure is recorded in the session log (llm.call /
// llm_error events) so misbehaving prompts can be replayed offline.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    apply_shared_guards, ActionType, DecisionSource, Strategy, StrategyContext, StrategyDecision,
};
use crate::config::AiStrategyConfig;
use crate::errors::BotError;
use crate::llm::{LlmProvider, LlmRequest};

/// Valid actions and their parameter contracts, enumerated for the model.
const ACTION_CONTRACTS: &str = "\
- move {\"to_sector\": int}: warp to an adjacent sector\n\
- trade_buy {\"sector\": int, \"commodity\": \"fuel_ore|organics|equipment\"}: buy at the port here\n\
- trade_sell {\"sector\": int, \"commodity\": \"fuel_ore|organics|equipment\"}: sell at the port here\n\
- dock {}: enter the port in the current sector\n\
- scan {}: refresh the sector display\n\
- wait {}: do nothing this turn\n\
- bank {}: deposit credits (only where banking exists)\n\
- upgrade {}: buy holds/fighters/shields at a special port\n\
- combat_engage {}: attack hostile fighters here\n\
- combat_retreat {\"to_sector\": int}: flee to an adjacent sector";

pub struct AiStrategy {
    config: AiStrategyConfig,
    provider: Arc<dyn LlmProvider>,
    fallback: Box<dyn Strategy>,
    consecutive_failures: u32,
    /// Turns remaining on the fallback before the LLM is retried.
    fallback_turns_left: u32,
}

impl AiStrategy {
    pub fn new(
        config: AiStrategyConfig,
        provider: Arc<dyn LlmProvider>,
        fallback: Box<dyn Strategy>,
    ) -> Self {
        Self {
            config,
            provider,
            fallback,
            consecutive_failures: 0,
            fallback_turns_left: 0,
        }
    }

    // ── Prompt assembly ─────────────────────────────────────────────────

    fn state_summary(&self, ctx: &StrategyContext<'_>) -> String {
        let s = ctx.state;
        let mut out = format!(
            "sector={:?} credits={:?} turns_left={:?} holds_free={:?}/{:?}\n\
             cargo: fuel_ore={} organics={} equipment={}\n\
             warps={:?} port={:?} (class {:?}) fighters={:?} shields={:?}",
            s.sector,
            s.credits,
            s.turns_remaining,
            s.holds_free,
            s.holds_total,
            s.cargo.fuel_ore,
            s.cargo.organics,
            s.cargo.equipment,
            s.warps,
            s.port_name,
            s.port_class,
            s.fighters,
            s.shields,
        );
        if self.config.context_mode == "full" {
            out.push_str(&format!(
                "\nvisited={} sectors, known ports={}",
                ctx.knowledge.visited.len(),
                ctx.knowledge.ports.len()
            ));
        }
        out
    }

    fn history_summary(&self, ctx: &StrategyContext<'_>) -> String {
        let window = self.config.history_window as usize;
        let start = ctx.history.len().saturating_sub(window);
        ctx.history[start..]
            .iter()
            .map(|r| {
                format!(
                    "turn {}: {} {} -> {} (profit {})",
                    r.turn,
                    r.decision.action,
                    r.decision.parameters,
                    if r.success { "ok" } else { "failed" },
                    r.profit,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn build_prompt(&self, ctx: &StrategyContext<'_>) -> String {
        let goal = ctx
            .goal
            .map(|g| format!("Current goal: {} (since turn {}).", g.goal_id, g.start_turn))
            .unwrap_or_else(|| "No explicit goal set.".to_string());

        format!(
            "You are piloting a trading ship in Trade Wars 2002.\n\n\
             GAME STATE:\n{}\n\n{}\n\nRECENT DECISIONS:\n{}\n\n\
             VALID ACTIONS:\n{}\n\n\
             Reply with ONLY a JSON object:\n\
             {{\"action\": \"<action>\", \"parameters\": {{...}}, \
             \"intent\": \"short sentence\", \"confidence\": 0.0}}",
            self.state_summary(ctx),
            goal,
            self.history_summary(ctx),
            ACTION_CONTRACTS,
        )
    }

    // ── Response parsing ────────────────────────────────────────────────

    /// Parse and validate the model's JSON reply into a decision.
    fn parse_response(&self, text: &str) -> Result<StrategyDecision, BotError> {
        // Models love code fences; strip them before parsing.
        let cleaned = text
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        let value: Value = serde_json::from_str(cleaned)
            .map_err(|e| BotError::Llm(format!("response is not JSON: {e}")))?;

        let action: ActionType = value["action"]
            .as_str()
            .ok_or_else(|| BotError::Llm("missing 'action' field".into()))?
            .parse()
            .map_err(|e: String| BotError::Llm(e))?;

        let confidence = value["confidence"].as_f64().unwrap_or(0.0);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(BotError::Llm(format!(
                "confidence {confidence} outside [0,1]"
            )));
        }

        let intent = value["intent"].as_str().unwrap_or("(no intent given)");
        let parameters = value
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({}));

        if action == ActionType::Move && parameters["to_sector"].as_u64().is_none() {
            return Err(BotError::Llm("move without to_sector".into()));
        }

        Ok(StrategyDecision {
            action,
            parameters,
            wake_reason: "llm_decision".to_string(),
            decision_source: DecisionSource::LlmDirect,
            strategy_id: "ai_strategy".to_string(),
            strategy_mode: "llm".to_string(),
            review_after_turns: None,
            intent: intent.to_string(),
        })
    }

    fn log_llm(&self, ctx: &StrategyContext<'_>, event: &str, payload: Value) {
        if let Some(logger) = ctx.logger {
            logger.log(event, payload);
        }
    }
}

#[async_trait]
impl Strategy for AiStrategy {
    fn id(&self) -> &str {
        "ai_strategy"
    }

    fn mode(&self) -> &str {
        if self.fallback_turns_left > 0 {
            "fallback"
        } else {
            "llm"
        }
    }

    async fn decide(&mut self, ctx: &StrategyContext<'_>) -> Result<StrategyDecision, BotError> {
        // Riding out a fallback window.
        if self.fallback_turns_left > 0 {
            self.fallback_turns_left -= 1;
            let mut decision = self.fallback.decide(ctx).await?;
            decision.decision_source = DecisionSource::Fallback;
            decision.strategy_mode = "fallback".to_string();
            return Ok(decision);
        }

        let prompt = self.build_prompt(ctx);
        let request = LlmRequest {
            prompt: prompt.clone(),
            max_tokens: 256,
            temperature: 0.3,
            timeout: std::time::Duration::from_millis(self.config.timeout_ms),
        };

        let outcome = match self.provider.generate(request).await {
            Ok(response) => {
                self.log_llm(
                    ctx,
                    "llm.call",
                    json!({
                        "purpose": "decide",
                        "model": response.model,
                        "duration_ms": response.duration_ms,
                        "prompt_tokens": response.prompt_tokens,
                        "completion_tokens": response.completion_tokens,
                        "prompt": prompt,
                        "response": response.text,
                    }),
                );
                self.parse_response(&response.text)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(decision) => {
                self.consecutive_failures = 0;
                debug!(action = %decision.action, intent = %decision.intent, "llm decision accepted");
                Ok(apply_shared_guards(ctx, decision))
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.config.fallback_threshold,
                    error = %e,
                    "llm decision failed"
                );
                self.log_llm(
                    ctx,
                    "llm_error",
                    json!({
                        "error": e.to_string(),
                        "consecutive_failures": self.consecutive_failures,
                    }),
                );

                if self.consecutive_failures >= self.config.fallback_threshold {
                    self.fallback_turns_left = self.config.fallback_duration_turns;
                    self.consecutive_failures = 0;
                    self.log_llm(
                        ctx,
                        "note",
                        json!({
                            "text": format!(
                                "ai_strategy switching to fallback for {} turns",
                                self.config.fallback_duration_turns
                            ),
                        }),
                    );
                }

                // This turn still needs an action: delegate to the fallback.
                let mut decision = self.fallback.decide(ctx).await?;
                decision.decision_source = DecisionSource::Fallback;
                decision.strategy_mode = "fallback".to_string();
                Ok(decision)
            }
        }
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.fallback_turns_left = 0;
        self.fallback.reset();
    }
}
