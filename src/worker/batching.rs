use crate::aggregator::BatchSpan;
use crate::transcript::Transcript;

pub const MIN_BATCH_SIZE: usize = 10;
pub const MAX_BATCH_SIZE: usize = 20;

/// Configured group size, held to the range the detector prompt is tuned for.
pub fn effective_batch_size(configured: usize) -> usize {
    configured.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}

/// Split a transcript into non-overlapping runs of `batch_size` consecutive
/// sentences. Sentence indices stay global so detector output can be
/// checked against its own span.
pub fn plan_batches(
    fingerprint: &str,
    episode_number: i64,
    transcript: &Transcript,
    batch_size: usize,
) -> Vec<BatchSpan> {
    let size = batch_size.max(1);
    transcript
        .sentences
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| BatchSpan {
            source_fingerprint: fingerprint.to_string(),
            episode_number,
            batch_index: i as i64,
            first_sentence: i * size,
            sentences: chunk.to_vec(),
        })
        .collect()
}
