//! Loss functions.
//!
//! A criterion maps an input and a target to a single-element variable. Only
//! the input receives a gradient; the target is treated as a constant.

use ndarray::{IxDyn, Zip};

use crate::variable::{Tensor, Variable};

/// Reduction applied to a criterion's elementwise losses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Mean,
}

impl Reduction {
    fn reduce(self, total: f32, numel: usize) -> f32 {
        match self {
            Self::Sum => total,
            Self::Mean => total / numel as f32,
        }
    }

    fn scale(self, numel: usize) -> f32 {
        match self {
            Self::Sum => 1.,
            Self::Mean => 1. / numel as f32,
        }
    }
}

/// A loss over an input and a target.
pub trait Criterion {
    fn forward(&self, input: &Variable, target: &Variable) -> Variable;
}

fn check_shapes(input: &Variable, target: &Variable) {
    assert_eq!(
        input.data().shape(),
        target.data().shape(),
        "error: input and target must have the same shape, got {:?} and {:?}.",
        input.data().shape(),
        target.data().shape()
    );
}

fn criterion_output(
    input: &Variable,
    target: &Variable,
    value: f32,
    grad_input: impl Fn(f32) -> Tensor + 'static,
) -> Variable {
    Variable::from_op(
        Tensor::from_elem(IxDyn(&[1]), value),
        &[input.clone(), target.clone()],
        move |grad| Ok(vec![Some(grad_input(grad[0])), None]),
        None,
    )
}

/// Mean squared error criterion.
///
/// ```text
///        1
/// L = ━━━━━━━ Σᵢ (xᵢ- yᵢ)²
///       numel
/// ```
pub struct MSELoss {
    reduction: Reduction,
}

impl MSELoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }
}

impl Criterion for MSELoss {
    fn forward(&self, input: &Variable, target: &Variable) -> Variable {
        check_shapes(input, target);
        let (input_data, target_data) = (input.data().clone(), target.data().clone());
        let numel = input_data.len();

        let total = Zip::from(&input_data)
            .and(&target_data)
            .fold(0., |loss, &input_el, &target_el| {
                loss + (input_el - target_el).powi(2)
            });
        let value = self.reduction.reduce(total, numel);

        let scale = self.reduction.scale(numel);
        criterion_output(input, target, value, move |grad_el| {
            let mut grad_input = Tensor::zeros(input_data.raw_dim());
            Zip::from(&mut grad_input)
                .and(&input_data)
                .and(&target_data)
                .for_each(|out_el, &input_el, &target_el| {
                    *out_el = 2. * (input_el - target_el) * scale * grad_el
                });
            grad_input
        })
    }
}

/// Mean absolute error criterion.
///
/// ```text
///        1
/// L = ━━━━━━━ Σᵢ |xᵢ- yᵢ|
///       numel
/// ```
pub struct L1Loss {
    reduction: Reduction,
}

impl L1Loss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }
}

impl Criterion for L1Loss {
    fn forward(&self, input: &Variable, target: &Variable) -> Variable {
        check_shapes(input, target);
        let (input_data, target_data) = (input.data().clone(), target.data().clone());
        let numel = input_data.len();

        let total = Zip::from(&input_data)
            .and(&target_data)
            .fold(0., |loss, &input_el, &target_el| {
                loss + (input_el - target_el).abs()
            });
        let value = self.reduction.reduce(total, numel);

        let scale = self.reduction.scale(numel);
        criterion_output(input, target, value, move |grad_el| {
            let mut grad_input = Tensor::zeros(input_data.raw_dim());
            Zip::from(&mut grad_input)
                .and(&input_data)
                .and(&target_data)
                .for_each(|out_el, &input_el, &target_el| {
                    *out_el = (input_el - target_el).signum() * scale * grad_el
                });
            grad_input
        })
    }
}

/// Binary cross-entropy criterion.
///
/// ```text
///        1
/// L = ━━━━━━━ Σᵢ - [yᵢ ln(xᵢ) + (1 - yᵢ) ln(1 - xᵢ)]
///       numel
/// ```
///
/// The input is expected to hold probabilities. Logarithms are clamped at
/// `-100`, so a certain but wrong prediction yields a large finite loss
/// rather than an infinite one.
pub struct BCELoss {
    reduction: Reduction,
}

impl BCELoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }
}

const LOG_CLAMP: f32 = -100.;

fn clamped_ln(el: f32) -> f32 {
    el.ln().max(LOG_CLAMP)
}

impl Criterion for BCELoss {
    fn forward(&self, input: &Variable, target: &Variable) -> Variable {
        check_shapes(input, target);
        let (input_data, target_data) = (input.data().clone(), target.data().clone());
        let numel = input_data.len();

        let total = Zip::from(&input_data)
            .and(&target_data)
            .fold(0., |loss, &input_el, &target_el| {
                loss - (target_el * clamped_ln(input_el)
                    + (1. - target_el) * clamped_ln(1. - input_el))
            });
        let value = self.reduction.reduce(total, numel);

        let scale = self.reduction.scale(numel);
        criterion_output(input, target, value, move |grad_el| {
            let mut grad_input = Tensor::zeros(input_data.raw_dim());
            Zip::from(&mut grad_input)
                .and(&input_data)
                .and(&target_data)
                .for_each(|out_el, &input_el, &target_el| {
                    let denominator = (input_el * (1. - input_el)).max(f32::EPSILON);
                    *out_el = (input_el - target_el) / denominator * scale * grad_el
                });
            grad_input
        })
    }
}

// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ Tests ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
#[cfg(test)]
mod test {
    use super::{BCELoss, Criterion, L1Loss, MSELoss, Reduction};
    use crate::variable::{Tensor, Variable};
    use ndarray::{array, IxDyn};

    #[test]
    fn mse_loss_mean() {
        let input = Variable::new(array![1.0_f32, 2., 3.].into_dyn());
        let target = Variable::detached(array![2.0_f32, 2., 5.].into_dyn());

        let loss = MSELoss::new(Reduction::Mean).forward(&input, &target);
        assert_eq!(loss.data()[0], 5. / 3.);

        loss.backward(Tensor::ones(IxDyn(&[1]))).unwrap();
        assert_eq!(
            *input.grad(),
            array![-2.0_f32 / 3., 0., -4. / 3.].into_dyn()
        );
        assert!(!target.has_grad());
    }

    #[test]
    fn mse_loss_sum() {
        let input = Variable::new(array![1.0_f32, 2., 3.].into_dyn());
        let target = Variable::detached(array![2.0_f32, 2., 5.].into_dyn());

        let loss = MSELoss::new(Reduction::Sum).forward(&input, &target);
        assert_eq!(loss.data()[0], 5.);

        loss.backward(Tensor::ones(IxDyn(&[1]))).unwrap();
        assert_eq!(*input.grad(), array![-2.0_f32, 0., -4.].into_dyn());
    }

    #[test]
    fn l1_loss_mean() {
        let input = Variable::new(array![1.0_f32, 4.].into_dyn());
        let target = Variable::detached(array![3.0_f32, 3.].into_dyn());

        let loss = L1Loss::new(Reduction::Mean).forward(&input, &target);
        assert_eq!(loss.data()[0], 1.5);

        loss.backward(Tensor::ones(IxDyn(&[1]))).unwrap();
        assert_eq!(*input.grad(), array![-0.5_f32, 0.5].into_dyn());
    }

    #[test]
    fn bce_loss_matches_the_closed_form() {
        let input = Variable::new(array![0.25_f32, 0.75].into_dyn());
        let target = Variable::detached(array![0.0_f32, 1.].into_dyn());

        let loss = BCELoss::new(Reduction::Mean).forward(&input, &target);
        let expected = -((1.0_f32 - 0.25).ln() + 0.75_f32.ln()) / 2.;
        assert!((loss.data()[0] - expected).abs() <= 1e-6);
    }

    #[test]
    fn bce_loss_is_finite_on_certain_wrong_predictions() {
        let input = Variable::new(array![0.0_f32, 1.].into_dyn());
        let target = Variable::detached(array![1.0_f32, 0.].into_dyn());

        let loss = BCELoss::new(Reduction::Mean).forward(&input, &target);
        assert!(loss.data()[0].is_finite());
        assert_eq!(loss.data()[0], 100.);
    }

    #[test]
    #[should_panic]
    fn mismatched_shapes() {
        let input = Variable::new(Tensor::ones(IxDyn(&[2, 3])));
        let target = Variable::detached(Tensor::ones(IxDyn(&[3, 2])));
        MSELoss::new(Reduction::Mean).forward(&input, &target);
    }
}
