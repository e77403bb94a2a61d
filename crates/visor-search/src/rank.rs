//! Dataset ranking and page retrieval.

use tracing::debug;

use visor_core::{Error, FeatureMatrix, RankedItem, Ranking, RankingPage, Result};

/// Score every dataset row against `weights` and order them best first.
///
/// Ties keep dataset order (stable sort). Fails if the weight length does
/// not match the dataset's column count.
pub fn rank(weights: &[f32], dataset: &FeatureMatrix) -> Result<Ranking> {
    if weights.len() != dataset.cols() {
        return Err(Error::DimensionMismatch {
            expected: dataset.cols(),
            actual: weights.len(),
        });
    }
    let scores = dataset.matvec(weights)?;
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    debug!(dataset_size = scores.len(), "Dataset ranked");
    Ok(Ranking { scores, order })
}

/// Number of pages for `len` items. A `page_size` of 0 means one page.
pub fn page_count(len: usize, page_size: usize) -> usize {
    if page_size == 0 {
        1
    } else {
        len.div_ceil(page_size)
    }
}

/// Extract 1-based `page` of `ranking`, resolving paths with `path_of`.
pub fn ranking_page<F>(ranking: &Ranking, page: usize, page_size: usize, path_of: F) -> Result<RankingPage>
where
    F: Fn(usize) -> Option<String>,
{
    let count = page_count(ranking.len(), page_size);
    if page == 0 || page > count {
        return Err(Error::CannotReturnRanking(format!(
            "page {} is out of range (page count {})",
            page, count
        )));
    }

    let (start, end) = if page_size == 0 {
        (0, ranking.len())
    } else {
        let start = (page - 1) * page_size;
        (start, (start + page_size).min(ranking.len()))
    };

    let rlist = ranking.order[start..end]
        .iter()
        .map(|&idx| {
            let path = path_of(idx).ok_or_else(|| {
                Error::CannotReturnRanking(format!("dataset index {} has no path", idx))
            })?;
            Ok(RankedItem {
                path,
                score: ranking.scores[idx],
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RankingPage {
        page,
        page_count: count,
        rlist,
    })
}
