use std::collections::HashSet;
use std::time::Instant;

use log::{debug, info};

use crate::error::Result;
use crate::sampler::Sampler;
use crate::state::State;
use crate::transformer::Model;

/// Ingests prompt tokens and generates new ones until a stop token or the
/// token budget is hit.
///
/// While prompt tokens remain the next token is force-picked from the
/// prompt: it is not appended to the result and the callback is not
/// invoked. Once the prompt is exhausted the sampler selects from the
/// logits; every sampled token is appended, handed to the callback, and a
/// stop token ends the loop (the stop token is included in the returned
/// list). `state.latest_token` tracks the current token on every
/// iteration, so a kept state can seed chained generation via
/// `start_position`.
///
/// The budget is clamped to the model's context length. With `echo` every
/// token id is logged, prompt and sampled alike.
#[allow(clippy::too_many_arguments)]
pub fn generate(
    model: &Model,
    state: &mut State,
    start_position: usize,
    prompt_tokens: &[usize],
    stop_tokens: &HashSet<usize>,
    max_tokens: usize,
    sampler: &mut dyn Sampler,
    echo: bool,
    mut on_token: Option<&mut dyn FnMut(usize)>,
) -> Result<Vec<usize>> {
    let max_positions = max_tokens.min(model.config.seq_len);
    let mut generated = Vec::new();
    let mut token = state.latest_token;
    let mut prompt_index = 0;
    let mut metrics = ThroughputMetrics::start();

    for position in start_position..max_positions {
        model.forward(state, token, position)?;

        let (next, sampled) = if prompt_index < prompt_tokens.len() {
            let forced = prompt_tokens[prompt_index];
            prompt_index += 1;
            metrics.prompt_token();
            (forced, false)
        } else {
            let next = sampler.sample(&state.logits);
            metrics.generated_token();
            (next, true)
        };

        if echo {
            debug!("token {next} at position {position} (sampled: {sampled})");
        }

        token = next;
        state.latest_token = next;

        if sampled {
            generated.push(next);
            if let Some(callback) = on_token.as_mut() {
                callback(next);
            }
            if stop_tokens.contains(&next) {
                break;
            }
        }
    }

    metrics.report();
    Ok(generated)
}

/// Wall-clock throughput split between prompt ingestion and generation.
struct ThroughputMetrics {
    started: Instant,
    generation_started: Option<Instant>,
    prompt_count: usize,
    generated_count: usize,
}

impl ThroughputMetrics {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            generation_started: None,
            prompt_count: 0,
            generated_count: 0,
        }
    }

    fn prompt_token(&mut self) {
        self.prompt_count += 1;
    }

    fn generated_token(&mut self) {
        if self.generation_started.is_none() {
            self.generation_started = Some(Instant::now());
        }
        self.generated_count += 1;
    }

    fn report(&self) {
        let total = self.prompt_count + self.generated_count;
        if total == 0 {
            return;
        }
        let total_secs = self.started.elapsed().as_secs_f64();
        let gen_secs = self
            .generation_started
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let prompt_secs = total_secs - gen_secs;

        info!(
            "{:.2} tokens/s ({total}) [prompt eval {:.2} tokens/s ({}), generation {:.2} tokens/s ({})]",
            rate(total, total_secs),
            rate(self.prompt_count, prompt_secs),
            self.prompt_count,
            rate(self.generated_count, gen_secs),
            self.generated_count,
        );
    }
}

fn rate(tokens: usize, secs: f64) -> f64 {
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}
