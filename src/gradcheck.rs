//! Finite-difference gradient checking.
//!
//! [`check_gradients`] compares the jacobian assembled from repeated backward
//! passes against one estimated with central differences. The forward closure
//! is re-evaluated after every perturbation, so it must be deterministic and
//! must read its inputs through the variables it was given.
//!
//! Everything runs in `f32`; the step size and the tolerance are chosen
//! accordingly. Inputs should keep their elements a couple of perturbations
//! away from kinks such as a rectifier's zero or a pooling argmax tie.

use ndarray::Array2;

use crate::error::AutogradError;
use crate::variable::{Tensor, Variable};

/// Step used for the central differences.
pub const PERTURBATION: f32 = 2e-3;
/// Greatest tolerated absolute deviation between the two jacobians.
pub const TOLERANCE: f32 = 1e-2;

fn total_numel(inputs: &[Variable]) -> usize {
    inputs.iter().map(|input| input.data().len()).sum()
}

/// Builds the jacobian of `forward` via one backward pass per output element.
///
/// Rows enumerate the elements of `inputs` in order, columns the elements of
/// the output.
pub fn analytical_jacobian(
    forward: &dyn Fn() -> Variable,
    inputs: &[Variable],
) -> Result<Array2<f32>, AutogradError> {
    let output = forward();
    let out_shape = output.data().raw_dim();
    let out_numel = output.data().len();

    let mut jacobian = Array2::zeros((total_numel(inputs), out_numel));
    for column in 0..out_numel {
        for input in inputs {
            input.zero_grad();
        }

        let mut seed = Tensor::zeros(out_shape.clone());
        if let Some(slice) = seed.as_slice_mut() {
            slice[column] = 1.;
        }
        output.backward(seed)?;

        let mut row = 0;
        for input in inputs {
            for &grad_el in input.grad().iter() {
                jacobian[(row, column)] = grad_el;
                row += 1;
            }
        }
    }

    Ok(jacobian)
}

/// Estimates the jacobian of `forward` with central differences.
pub fn numerical_jacobian(forward: &dyn Fn() -> Variable, inputs: &[Variable]) -> Array2<f32> {
    let out_numel = forward().data().len();
    let mut jacobian = Array2::zeros((total_numel(inputs), out_numel));

    let mut row = 0;
    for input in inputs {
        let numel = input.data().len();
        for flat in 0..numel {
            let original = {
                let mut data = input.data_mut();
                let slice = data.as_slice_mut().expect("contiguous input data");
                let original = slice[flat];
                slice[flat] = original + PERTURBATION;
                original
            };
            let shifted_up: Vec<f32> = forward().data().iter().copied().collect();

            {
                let mut data = input.data_mut();
                data.as_slice_mut().expect("contiguous input data")[flat] =
                    original - PERTURBATION;
            }
            let shifted_down: Vec<f32> = forward().data().iter().copied().collect();

            {
                let mut data = input.data_mut();
                data.as_slice_mut().expect("contiguous input data")[flat] = original;
            }

            for (column, (up, down)) in shifted_up.iter().zip(&shifted_down).enumerate() {
                jacobian[(row, column)] = (up - down) / (2. * PERTURBATION);
            }
            row += 1;
        }
    }

    jacobian
}

/// Asserts that the analytical and the numerical jacobian of `forward` agree
/// to within [`TOLERANCE`] for every element of `inputs`.
///
/// # Panics
///
/// If the jacobians disagree or the backward pass fails.
pub fn check_gradients(forward: &dyn Fn() -> Variable, inputs: &[Variable]) {
    let analytical = match analytical_jacobian(forward, inputs) {
        Ok(analytical) => analytical,
        Err(error) => panic!("backward pass failed during the gradient check: {}", error),
    };
    let numerical = numerical_jacobian(forward, inputs);

    let mut worst = 0.0_f32;
    for (&analytical_el, &numerical_el) in analytical.iter().zip(numerical.iter()) {
        worst = worst.max((analytical_el - numerical_el).abs());
    }
    assert!(
        worst <= TOLERANCE,
        "jacobians disagree: max deviation {} exceeds the tolerance {}.",
        worst,
        TOLERANCE
    );
}
