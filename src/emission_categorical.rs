//! Categorical (multinomial) emissions over a finite symbol alphabet.

use std::ops::Range;

use crate::clustering::Clusterer;
use crate::emission_models::EmissionModel;
use crate::errors::{validate_probability_vector, HmmError, HmmResult};
use crate::hmm_config::ParamGroups;
use crate::math_utils::{normalize, safe_ln, sample_from_cdf};
use crate::rng::ModelRng;
use crate::sequences::SequenceIndex;

/// Check that a training batch uses exactly the symbols `0..V` and return `V`.
///
/// A batch holding a single observation is rejected, as is any batch whose
/// distinct symbols leave a gap.
///
/// # Example
/// ```rust
/// use hmmkit::emission_categorical::validate_symbols;
///
/// assert_eq!(validate_symbols(&[0, 0, 2, 1, 3, 1, 1]).unwrap(), 4);
/// assert!(validate_symbols(&[0, 0, 3, 5, 10]).is_err());
/// ```
pub fn validate_symbols(symbols: &[usize]) -> HmmResult<usize> {
    if symbols.len() < 2 {
        return Err(HmmError::observation(
            None,
            format!(
                "at least two symbols are required for training, got {}",
                symbols.len()
            ),
        ));
    }
    let mut distinct = symbols.to_vec();
    distinct.sort_unstable();
    distinct.dedup();

    if let Some((i, &s)) = distinct.iter().enumerate().find(|(i, &s)| s != *i) {
        return Err(HmmError::observation(
            symbols.iter().position(|&x| x == s),
            format!(
                "symbols must be contiguous integers starting at 0, symbol {} is missing",
                i
            ),
        ));
    }
    Ok(distinct.len())
}

/// Per-state probability table over `n_features` symbols.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CategoricalEmission {
    n_states: usize,
    n_features: Option<usize>,
    emissionprob: Vec<Vec<f64>>,
}

impl CategoricalEmission {
    pub fn new(n_states: usize) -> Self {
        Self {
            n_states,
            n_features: None,
            emissionprob: Vec::new(),
        }
    }

    /// Number of symbols, once known.
    pub fn n_features(&self) -> Option<usize> {
        self.n_features
    }

    pub fn emissionprob(&self) -> &[Vec<f64>] {
        &self.emissionprob
    }

    /// Assign the emission table, one row-stochastic row per state.
    pub fn set_emissionprob(&mut self, emissionprob: Vec<Vec<f64>>) -> HmmResult<()> {
        if emissionprob.len() != self.n_states {
            return Err(HmmError::shape("emissionprob", self.n_states, emissionprob.len()));
        }
        let n_symbols = match self.n_features {
            Some(v) => v,
            None => emissionprob.first().map(|r| r.len()).unwrap_or(0),
        };
        for (k, row) in emissionprob.iter().enumerate() {
            validate_probability_vector(row, n_symbols, "emissionprob", Some(k))?;
        }
        self.n_features = Some(n_symbols);
        self.emissionprob = emissionprob;
        Ok(())
    }
}

impl EmissionModel for CategoricalEmission {
    type Observations = Vec<usize>;
    type Stats = Vec<Vec<f64>>;

    fn family(&self) -> &'static str {
        "categorical"
    }

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn is_initialized(&self) -> bool {
        self.n_features.is_some() && self.emissionprob.len() == self.n_states
    }

    fn initialize(
        &mut self,
        obs: &Vec<usize>,
        _index: &SequenceIndex,
        init_params: &ParamGroups,
        _clusterer: &dyn Clusterer,
        rng: &mut ModelRng,
    ) -> HmmResult<()> {
        let n_symbols = validate_symbols(obs)?;
        let n_features = match self.n_features {
            Some(v) if v < n_symbols => {
                return Err(HmmError::shape("number of symbols", v, n_symbols))
            }
            Some(v) => v,
            None => n_symbols,
        };
        self.n_features = Some(n_features);

        if init_params.location || self.emissionprob.len() != self.n_states {
            self.emissionprob = (0..self.n_states)
                .map(|_| {
                    let mut row: Vec<f64> = (0..n_features).map(|_| rng.f64()).collect();
                    normalize(&mut row);
                    row
                })
                .collect();
        }
        Ok(())
    }

    fn validate(&self) -> HmmResult<()> {
        let n_features = self.n_features.ok_or_else(|| HmmError::NotInitialized {
            operation: "validate".to_string(),
        })?;
        if self.emissionprob.len() != self.n_states {
            return Err(HmmError::shape("emissionprob", self.n_states, self.emissionprob.len()));
        }
        for (k, row) in self.emissionprob.iter().enumerate() {
            validate_probability_vector(row, n_features, "emissionprob", Some(k))?;
        }
        Ok(())
    }

    fn check_observations(&self, obs: &Vec<usize>) -> HmmResult<()> {
        if let Some(v) = self.n_features {
            if let Some((t, &s)) = obs.iter().enumerate().find(|(_, &s)| s >= v) {
                return Err(HmmError::observation(
                    Some(t),
                    format!("symbol {} is outside the alphabet 0..{}", s, v),
                ));
            }
        }
        Ok(())
    }

    fn log_likelihood(&self, obs: &Vec<usize>, span: Range<usize>) -> HmmResult<Vec<Vec<f64>>> {
        let start = span.start;
        obs[span]
            .iter()
            .enumerate()
            .map(|(t, &symbol)| {
                self.emissionprob
                    .iter()
                    .map(|row| {
                        row.get(symbol).map(|&p| safe_ln(p)).ok_or_else(|| {
                            HmmError::observation(
                                Some(start + t),
                                format!("symbol {} is outside the alphabet 0..{}", symbol, row.len()),
                            )
                        })
                    })
                    .collect()
            })
            .collect()
    }

    fn initialize_sufficient_statistics(&self) -> Vec<Vec<f64>> {
        vec![vec![0.0; self.n_features.unwrap_or(0)]; self.n_states]
    }

    fn accumulate(
        &self,
        stats: &mut Vec<Vec<f64>>,
        obs: &Vec<usize>,
        span: Range<usize>,
        posteriors: &[Vec<f64>],
        _params: &ParamGroups,
    ) -> HmmResult<()> {
        for (&symbol, gamma) in obs[span].iter().zip(posteriors.iter()) {
            for (k, &g) in gamma.iter().enumerate() {
                stats[k][symbol] += g;
            }
        }
        Ok(())
    }

    fn m_step(&mut self, stats: &Vec<Vec<f64>>, params: &ParamGroups) -> HmmResult<()> {
        if !params.location {
            return Ok(());
        }
        for (row, counts) in self.emissionprob.iter_mut().zip(stats.iter()) {
            if counts.iter().sum::<f64>() > 0.0 {
                let mut updated = counts.clone();
                normalize(&mut updated);
                *row = updated;
            }
        }
        Ok(())
    }

    fn sample(&self, state: usize, rng: &mut ModelRng) -> HmmResult<usize> {
        let row = self.emissionprob.get(state).ok_or_else(|| HmmError::NotInitialized {
            operation: "sample".to_string(),
        })?;
        Ok(sample_from_cdf(row, rng.f64()))
    }

    fn empty_observations(&self) -> Vec<usize> {
        Vec::new()
    }

    fn n_free_parameters(&self) -> usize {
        self.n_states * self.n_features.unwrap_or(1).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::KMeansClusterer;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_contiguous_symbols_accepted() {
        assert_eq!(validate_symbols(&[0, 0, 2, 1, 3, 1, 1]).unwrap(), 4);
    }

    #[test]
    fn test_gapped_symbols_rejected() {
        match validate_symbols(&[0, 0, 3, 5, 10]) {
            Err(HmmError::InvalidObservation { index, .. }) => assert_eq!(index, Some(2)),
            other => panic!("Expected InvalidObservation, got {:?}", other),
        }
        assert!(validate_symbols(&[1, 2, 3]).is_err());
        assert!(validate_symbols(&[0]).is_err());
    }

    #[test]
    fn test_initialization_draws_stochastic_rows() {
        let mut model = CategoricalEmission::new(3);
        let obs = vec![0, 1, 2, 1, 0];
        model
            .initialize(
                &obs,
                &SequenceIndex::single(5),
                &ParamGroups::all(),
                &KMeansClusterer::default(),
                &mut ModelRng::with_seed(8),
            )
            .unwrap();
        assert_eq!(model.n_features(), Some(3));
        assert!(model.validate().is_ok());
    }

    #[test]
    fn test_m_step_is_normalized_ratio() {
        let mut model = CategoricalEmission::new(1);
        model.set_emissionprob(vec![vec![0.5, 0.5]]).unwrap();
        let obs = vec![0, 0, 0, 1];
        let mut stats = model.initialize_sufficient_statistics();
        model
            .accumulate(&mut stats, &obs, 0..4, &vec![vec![1.0]; 4], &ParamGroups::all())
            .unwrap();
        model.m_step(&stats, &ParamGroups::all()).unwrap();
        assert_approx_eq!(model.emissionprob()[0][0], 0.75);
        assert_approx_eq!(model.emissionprob()[0][1], 0.25);
    }

    #[test]
    fn test_unknown_symbol_at_inference() {
        let mut model = CategoricalEmission::new(1);
        model.set_emissionprob(vec![vec![1.0, 0.0]]).unwrap();
        assert!(model.check_observations(&vec![0, 2]).is_err());
        let ll = model.log_likelihood(&vec![0, 1], 0..2).unwrap();
        assert_eq!(ll[0][0], 0.0);
        assert_eq!(ll[1][0], f64::NEG_INFINITY);
    }
}
