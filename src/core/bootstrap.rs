use rand::Rng;

use super::error::SimResult;
use super::types::{BlockRange, HistoricalReturnRecord};

pub fn block_bootstrap<R: Rng + ?Sized>(
    history: &[HistoricalReturnRecord],
    retirement_years: usize,
    blocks: BlockRange,
    rng: &mut R,
) -> SimResult<Vec<HistoricalReturnRecord>> {
    blocks.validate()?;
    let n = history.len();
    if n == 0 || retirement_years == 0 {
        return Ok(Vec::new());
    }

    let mut sampled = Vec::with_capacity(retirement_years + blocks.max);
    while sampled.len() < retirement_years {
        let block_size = rng.random_range(blocks.min..=blocks.max);
        let start = rng.random_range(0..n);
        sampled.extend((start..start + block_size).map(|idx| history[idx % n]));
    }
    sampled.truncate(retirement_years);
    Ok(sampled)
}
