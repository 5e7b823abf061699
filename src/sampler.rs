/// Maps logits to a token id.
///
/// From the core's perspective a sampler is a pure function of the logits;
/// temperature, nucleus and other strategies live with the caller. NaN or
/// infinite logits reach the sampler unfiltered and its behavior on them is
/// its own.
pub trait Sampler {
    fn sample(&mut self, logits: &[f32]) -> usize;
}

/// Greedy decoding: returns the index of the maximum logit.
#[derive(Debug, Default)]
pub struct ArgmaxSampler;

impl Sampler for ArgmaxSampler {
    fn sample(&mut self, logits: &[f32]) -> usize {
        logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
            .unwrap_or_default()
    }
}
