//! Scoped parameter injection.
//!
//! [`ParameterScope`] swaps a parameter record into a model and puts the
//! previous record back when dropped, so the restore also runs on `?`
//! returns and during panic unwinding.

use std::ops::{Deref, DerefMut};

use ssm_common::Result;

use crate::models::StateSpaceModel;

/// Guard holding a model with temporarily replaced parameters.
pub struct ParameterScope<'m, M: StateSpaceModel> {
    model: &'m mut M,
    previous: Option<M::Params>,
}

impl<'m, M: StateSpaceModel> ParameterScope<'m, M> {
    pub fn enter(model: &'m mut M, params: M::Params) -> Self {
        let previous = model.replace_params(params);
        Self {
            model,
            previous: Some(previous),
        }
    }

    /// The record that will be restored on exit.
    pub fn previous(&self) -> Option<&M::Params> {
        self.previous.as_ref()
    }
}

impl<M: StateSpaceModel> Deref for ParameterScope<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: StateSpaceModel> DerefMut for ParameterScope<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: StateSpaceModel> Drop for ParameterScope<'_, M> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.model.replace_params(previous);
        }
    }
}

/// Runs `f` with `params` injected; the model's own record is back in place
/// before the result is returned.
pub fn with_parameters<M, T, F>(model: &mut M, params: M::Params, f: F) -> Result<T>
where
    M: StateSpaceModel,
    F: FnOnce(&mut M) -> Result<T>,
{
    let mut scope = ParameterScope::enter(model, params);
    f(&mut *scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use crate::inference::Posterior;
    use crate::models::MStepContext;
    use ssm_common::Error;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    struct Fixed(f64);

    impl Posterior for Fixed {
        fn marginal_log_likelihood(&self) -> f64 {
            self.0
        }

        fn num_timesteps(&self) -> usize {
            1
        }
    }

    struct Counter {
        value: f64,
    }

    impl StateSpaceModel for Counter {
        type Params = f64;
        type Posterior = Fixed;

        fn params(&self) -> &f64 {
            &self.value
        }

        fn replace_params(&mut self, params: f64) -> f64 {
            std::mem::replace(&mut self.value, params)
        }

        fn e_step(&self, _dataset: &Dataset) -> Result<Vec<Fixed>> {
            Ok(vec![Fixed(self.value)])
        }

        fn m_step(&self, _d: &Dataset, _p: &[Fixed], _c: &MStepContext<'_>) -> Result<f64> {
            Ok(self.value + 1.0)
        }
    }

    #[test]
    fn test_restores_after_success() {
        let mut model = Counter { value: 1.0 };
        let seen = with_parameters(&mut model, 5.0, |m| Ok(*m.params())).unwrap();
        assert_eq!(seen, 5.0);
        assert_eq!(model.value, 1.0);
    }

    #[test]
    fn test_restores_after_error() {
        let mut model = Counter { value: 1.0 };
        let res: Result<()> = with_parameters(&mut model, 5.0, |_| {
            Err(Error::Numerical("boom".into()))
        });
        assert!(res.is_err());
        assert_eq!(model.value, 1.0);
    }

    #[test]
    fn test_restores_after_panic() {
        let mut model = Counter { value: 1.0 };
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _ = with_parameters(&mut model, 5.0, |_| -> Result<()> { panic!("inside scope") });
        }));
        assert!(outcome.is_err());
        assert_eq!(model.value, 1.0);
    }

    #[test]
    fn test_guard_restores_even_if_replaced_inside() {
        let mut model = Counter { value: 1.0 };
        {
            let mut scope = ParameterScope::enter(&mut model, 2.0);
            assert_eq!(scope.previous(), Some(&1.0));
            scope.replace_params(9.0);
            assert_eq!(*scope.params(), 9.0);
        }
        assert_eq!(model.value, 1.0);
    }
}
