//! Per-query data.

use parking_lot::Mutex;
use tracing::{debug, info};

use visor_core::{FeatureMatrix, LinearModel, NotificationBus, QueryState, Ranking};

/// Positive training rows and where each came from.
#[derive(Debug, Default)]
pub struct Positives {
    pub feats: FeatureMatrix,
    pub paths: Vec<String>,
}

/// One client query.
///
/// `positives` is the append lock: ingestion holds it while checking the
/// state and appending, so no row lands after the query left `DataColl`.
/// Model and ranking are only written by the train/rank worker that owns
/// the query while it is `Training`/`Ranking`.
pub struct QueryRecord {
    id: String,
    tag: Mutex<String>,
    state: Mutex<QueryState>,
    positives: Mutex<Positives>,
    model: Mutex<Option<LinearModel>>,
    ranking: Mutex<Option<Ranking>>,
}

impl QueryRecord {
    pub fn new(id: String, tag: String, code_size: usize) -> Self {
        Self {
            id,
            tag: Mutex::new(tag),
            state: Mutex::new(QueryState::DataColl),
            positives: Mutex::new(Positives {
                feats: FeatureMatrix::with_cols(code_size),
                paths: Vec::new(),
            }),
            model: Mutex::new(None),
            ranking: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tag(&self) -> String {
        self.tag.lock().clone()
    }

    pub fn set_tag(&self, tag: &str) {
        *self.tag.lock() = tag.to_string();
    }

    pub fn state(&self) -> QueryState {
        *self.state.lock()
    }

    /// Whether ingestion may still append rows.
    pub fn accepts_positives(&self) -> bool {
        self.state() == QueryState::DataColl
    }

    /// Move to `to` and post the change.
    pub fn set_state(&self, to: QueryState, bus: &NotificationBus) {
        let from = std::mem::replace(&mut *self.state.lock(), to);
        info!(query_id = %self.id, from = %from, state = %to, "Query state changed");
        bus.post_state_change(&self.id, to);
    }

    /// Atomically move from a state accepted by `allowed` to `to`.
    ///
    /// Returns the previous state, or `Err` with the current state when
    /// `allowed` rejects it. Posts the change on success.
    pub fn transition<F>(
        &self,
        allowed: F,
        to: QueryState,
        bus: &NotificationBus,
    ) -> std::result::Result<QueryState, QueryState>
    where
        F: Fn(QueryState) -> bool,
    {
        let from = {
            let mut state = self.state.lock();
            if !allowed(*state) {
                return Err(*state);
            }
            std::mem::replace(&mut *state, to)
        };
        info!(query_id = %self.id, from = %from, state = %to, "Query state changed");
        bus.post_state_change(&self.id, to);
        Ok(from)
    }

    /// Close data collection if it is still open. Returns whether it was.
    pub fn complete_data_collection(&self, bus: &NotificationBus) -> bool {
        self.transition(|s| s == QueryState::DataColl, QueryState::DataCollComplete, bus)
            .is_ok()
    }

    /// Append one positive row if the query is still collecting.
    ///
    /// A row arriving after the query moved on is dropped, not an error.
    pub fn append_positive(&self, feats: &FeatureMatrix, path: &str) -> visor_core::Result<bool> {
        let mut positives = self.positives.lock();
        if !self.accepts_positives() {
            debug!(query_id = %self.id, source = path, "Query no longer collecting, row dropped");
            return Ok(false);
        }
        positives.feats.append(feats)?;
        positives.paths.push(path.to_string());
        Ok(true)
    }

    pub fn positive_count(&self) -> usize {
        self.positives.lock().paths.len()
    }

    /// Copy of the positive rows.
    pub fn positive_feats(&self) -> FeatureMatrix {
        self.positives.lock().feats.clone()
    }

    pub fn positive_paths(&self) -> Vec<String> {
        self.positives.lock().paths.clone()
    }

    pub fn model(&self) -> Option<LinearModel> {
        self.model.lock().clone()
    }

    pub fn set_model(&self, model: LinearModel) {
        *self.model.lock() = Some(model);
        *self.ranking.lock() = None;
    }

    pub fn set_ranking(&self, ranking: Ranking) {
        *self.ranking.lock() = Some(ranking);
    }

    /// Run `f` on the ranking, if there is one.
    pub fn with_ranking<T>(&self, f: impl FnOnce(&Ranking) -> T) -> Option<T> {
        self.ranking.lock().as_ref().map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(v: f32) -> FeatureMatrix {
        FeatureMatrix::from_rows(2, &[vec![v, v]]).unwrap()
    }

    #[test]
    fn test_append_only_while_collecting() {
        let bus = NotificationBus::new();
        let query = QueryRecord::new("q".to_string(), "cat".to_string(), 2);

        assert!(query.append_positive(&row(1.0), "a.jpg").unwrap());
        assert!(query.complete_data_collection(&bus));
        assert!(!query.append_positive(&row(2.0), "b.jpg").unwrap());

        assert_eq!(query.positive_count(), 1);
        assert_eq!(query.positive_paths(), vec!["a.jpg".to_string()]);
        assert_eq!(bus.state_change.try_pop().unwrap().state, QueryState::DataCollComplete);
    }

    #[test]
    fn test_complete_is_noop_after_training_started() {
        let bus = NotificationBus::new();
        let query = QueryRecord::new("q".to_string(), "q".to_string(), 2);
        query.set_state(QueryState::Training, &bus);
        assert!(!query.complete_data_collection(&bus));
        assert_eq!(query.state(), QueryState::Training);
    }

    #[test]
    fn test_transition_guard_reports_current_state() {
        let bus = NotificationBus::new();
        let query = QueryRecord::new("q".to_string(), "q".to_string(), 2);
        let err = query
            .transition(|s| s == QueryState::Trained, QueryState::Ranking, &bus)
            .unwrap_err();
        assert_eq!(err, QueryState::DataColl);
        assert!(bus.state_change.try_pop().is_none());
    }

    #[test]
    fn test_wrong_width_row_rejected() {
        let query = QueryRecord::new("q".to_string(), "q".to_string(), 3);
        assert!(query.append_positive(&row(1.0), "a.jpg").is_err());
        assert_eq!(query.positive_count(), 0);
    }

    #[test]
    fn test_new_model_clears_ranking() {
        let query = QueryRecord::new("q".to_string(), "q".to_string(), 2);
        query.set_ranking(Ranking {
            scores: vec![1.0],
            order: vec![0],
        });
        query.set_model(LinearModel {
            weights: vec![1.0, 0.0],
            bias: 0.0,
        });
        assert!(query.with_ranking(|r| r.len()).is_none());
        assert!(query.model().is_some());
    }
}
