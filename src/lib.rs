//! The `tensorika` crate provides eager reverse-mode autodifferentiation and
//! the neural network building blocks built on top of it.
//!
//! # Variables
//!
//! The central abstraction is the [`Variable`]: a dynamically dimensioned
//! `f32` tensor bundled with its accumulated gradient and, for the results of
//! differentiable operations, a recorded backward function.
//!
//! Leaf variables are created with [`zeros()`], [`ones()`], [`full()`] and
//! [`rand()`], or directly from a tensor with [`Variable::new`]. Calling
//! [`.backward()`](Variable::backward) on an operation's output propagates a
//! seed gradient down to every gradient-requiring leaf.
//!
//! Variables created with [`Variable::volatile`] opt out of gradient
//! recording altogether: anything computed from them is inference-only, and
//! asking for its backward pass is an error.
//!
//! # Layers
//!
//! The [`nn`] module hosts the layers: linear maps, convolutions, pooling,
//! dropout and the common activations, along with the losses in
//! [`nn::loss`]. Every layer implements [`nn::Module`] and supports named
//! forward and backward hooks.
//!
//! # Gradient checking
//!
//! The [`gradcheck`] module verifies a backward function against a
//! finite-difference estimate of the jacobian, which is how the integration
//! suite validates each layer.

pub mod error;
pub mod gradcheck;
pub mod nn;
pub mod variable;

pub use error::AutogradError;
pub use variable::{Tensor, Variable};

use ndarray::IxDyn;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

/// Creates a gradient-requiring leaf filled with zeros.
pub fn zeros(shape: &[usize]) -> Variable {
    Variable::new(Tensor::zeros(IxDyn(shape)))
}

/// Creates a gradient-requiring leaf filled with ones.
pub fn ones(shape: &[usize]) -> Variable {
    Variable::new(Tensor::ones(IxDyn(shape)))
}

/// Creates a gradient-requiring leaf filled with `value`.
pub fn full(shape: &[usize], value: f32) -> Variable {
    Variable::new(Tensor::from_elem(IxDyn(shape), value))
}

/// Creates a gradient-requiring leaf with elements drawn from U(0, 1).
pub fn rand(shape: &[usize]) -> Variable {
    Variable::new(Tensor::random(IxDyn(shape), Uniform::new(0., 1.)))
}
