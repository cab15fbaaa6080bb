//! Neural network modules.
//!
//! A [`Module`] is a stateful transformation over a [`Variable`]. Modules own
//! their learnable parameters, propagate the volatile and gradient-requiring
//! flags of their inputs, and carry a named [`Hooks`] registry whose forward
//! hooks fire on every forward call and whose backward hooks fire on every
//! backward pass through the module's output.

use std::cell::RefCell;
use std::rc::Rc;

use ndarray::{Axis, Ix1, Ix2, Zip};

use crate::variable::{Tensor, Variable};

pub mod convolution;
pub mod dropout;
pub mod loss;
pub mod pooling;
mod utils;

pub use convolution::{Conv1d, Conv2d, Conv3d};
pub use dropout::{Dropout, Dropout2d, Dropout3d};
pub use pooling::{
    AvgPool1d, AvgPool2d, AvgPool3d, MaxPool1d, MaxPool2d, MaxPool3d, MaxUnpool1d, MaxUnpool2d,
    MaxUnpool3d,
};

// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ init module ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
pub mod init {
    use super::Variable;
    use rand::thread_rng;
    use rand_distr::{Distribution, Normal, Uniform};

    /// Fills the parameter with `value`.
    pub fn constant(param: &Variable, value: f32) {
        param.data_mut().map_inplace(|el| *el = value);
    }

    /// Fills the parameter with `0.0`.
    pub fn zeros(param: &Variable) {
        constant(param, 0.);
    }

    /// Fills the parameter with `1.0`.
    pub fn ones(param: &Variable) {
        constant(param, 1.);
    }

    /// Fills the parameter with elements drawn from
    /// the uniform distribution U(low, high).
    pub fn uniform(param: &Variable, low: f32, high: f32) {
        let unif_distr = Uniform::new(low, high);
        let mut t_rng = thread_rng();
        param
            .data_mut()
            .map_inplace(|el| *el = unif_distr.sample(&mut t_rng));
    }

    /// Fills the parameter with elements drawn from
    /// the normal distribution N(mean, std^2).
    pub fn normal(param: &Variable, mean: f32, std: f32) {
        let norm_distr = Normal::new(mean, std).unwrap();
        let mut t_rng = thread_rng();
        param
            .data_mut()
            .map_inplace(|el| *el = norm_distr.sample(&mut t_rng));
    }
}

// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ Hooks ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

type ForwardHook = Rc<dyn Fn(&[Variable], &Variable)>;
type BackwardHook = Rc<dyn Fn(&[Tensor], &Tensor)>;

/// Named forward and backward hooks of a module.
///
/// Hooks are invoked in insertion order. Registering a hook under an existing
/// name replaces the callback while keeping its position. Backward hooks are
/// looked up when the backward pass runs, so a hook registered after a forward
/// call still observes the backward pass of that call's output.
#[derive(Default)]
pub struct Hooks {
    forward: RefCell<Vec<(String, ForwardHook)>>,
    backward: RefCell<Vec<(String, BackwardHook)>>,
}

fn insert<T>(slot: &RefCell<Vec<(String, T)>>, name: &str, hook: T) {
    let mut hooks = slot.borrow_mut();
    match hooks.iter_mut().find(|(existing, _)| existing == name) {
        Some((_, existing)) => *existing = hook,
        None => hooks.push((name.to_string(), hook)),
    }
}

fn remove<T>(slot: &RefCell<Vec<(String, T)>>, name: &str) -> bool {
    let mut hooks = slot.borrow_mut();
    match hooks.iter().position(|(existing, _)| existing == name) {
        Some(position) => {
            hooks.remove(position);
            true
        }
        None => false,
    }
}

impl Hooks {
    /// Registers a forward hook under `name`.
    ///
    /// The hook receives the forward call's inputs and its output.
    pub fn register_forward(&self, name: &str, hook: impl Fn(&[Variable], &Variable) + 'static) {
        insert(&self.forward, name, Rc::new(hook) as ForwardHook);
    }

    /// Registers a backward hook under `name`.
    ///
    /// The hook receives the gradients computed for the module's inputs and
    /// the upstream gradient.
    pub fn register_backward(&self, name: &str, hook: impl Fn(&[Tensor], &Tensor) + 'static) {
        insert(&self.backward, name, Rc::new(hook) as BackwardHook);
    }

    /// Removes the forward hook registered under `name`, returning whether it
    /// was present.
    pub fn remove_forward(&self, name: &str) -> bool {
        remove(&self.forward, name)
    }

    /// Removes the backward hook registered under `name`, returning whether
    /// it was present.
    pub fn remove_backward(&self, name: &str) -> bool {
        remove(&self.backward, name)
    }

    // Invocation works on a snapshot of the registry so that a hook body is
    // free to register or remove hooks.
    pub(crate) fn notify_forward(&self, inputs: &[Variable], output: &Variable) {
        let snapshot: Vec<ForwardHook> = self
            .forward
            .borrow()
            .iter()
            .map(|(_, hook)| Rc::clone(hook))
            .collect();
        for hook in snapshot {
            hook(inputs, output);
        }
    }

    pub(crate) fn notify_backward(&self, grad_inputs: &[Tensor], grad_output: &Tensor) {
        let snapshot: Vec<BackwardHook> = self
            .backward
            .borrow()
            .iter()
            .map(|(_, hook)| Rc::clone(hook))
            .collect();
        for hook in snapshot {
            hook(grad_inputs, grad_output);
        }
    }
}

// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ Module ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

/// A stateful transformation with optional learnable parameters.
pub trait Module {
    /// Applies the module to `input`.
    fn forward(&self, input: &Variable) -> Variable;

    /// The module's learnable parameters.
    fn parameters(&self) -> Vec<Variable> {
        Vec::new()
    }

    /// The module's hook registry.
    fn hooks(&self) -> &Hooks;

    /// Zeroes the gradients of every parameter.
    fn zero_grad(&self) {
        for parameter in self.parameters() {
            parameter.zero_grad();
        }
    }

    fn register_forward_hook(&self, name: &str, hook: impl Fn(&[Variable], &Variable) + 'static)
    where
        Self: Sized,
    {
        self.hooks().register_forward(name, hook);
    }

    fn register_backward_hook(&self, name: &str, hook: impl Fn(&[Tensor], &Tensor) + 'static)
    where
        Self: Sized,
    {
        self.hooks().register_backward(name, hook);
    }

    fn remove_forward_hook(&self, name: &str) -> bool
    where
        Self: Sized,
    {
        self.hooks().remove_forward(name)
    }

    fn remove_backward_hook(&self, name: &str) -> bool
    where
        Self: Sized,
    {
        self.hooks().remove_backward(name)
    }
}

/// Builds an elementwise operation's output and fires the forward hooks.
pub(crate) fn elementwise(
    input: &Variable,
    hooks: &Rc<Hooks>,
    data: Tensor,
    grad_fn: impl Fn(&Tensor) -> Tensor + 'static,
) -> Variable {
    let output = Variable::from_op(
        data,
        std::slice::from_ref(input),
        move |grad| Ok(vec![Some(grad_fn(grad))]),
        Some(Rc::clone(hooks)),
    );
    hooks.notify_forward(std::slice::from_ref(input), &output);
    output
}

// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ Activations ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

/// Applies the sigmoid function elementwise.
///
/// **σ(x) = 1 / (1 + e^-x)**
#[derive(Default)]
pub struct Sigmoid {
    hooks: Rc<Hooks>,
}

impl Sigmoid {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for Sigmoid {
    fn forward(&self, input: &Variable) -> Variable {
        let data = input.data().mapv(|el| 1. / (1. + (-el).exp()));
        let forward_data = data.clone();
        elementwise(input, &self.hooks, data, move |grad| {
            let mut operand_gradient = Tensor::zeros(forward_data.raw_dim());
            Zip::from(&mut operand_gradient)
                .and(grad)
                .and(&forward_data)
                .for_each(|op_grad_el, &grad_el, &data_el| {
                    *op_grad_el = grad_el * data_el * (1. - data_el)
                });
            operand_gradient
        })
    }

    fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}

/// Applies the hyperbolic tangent elementwise.
#[derive(Default)]
pub struct Tanh {
    hooks: Rc<Hooks>,
}

impl Tanh {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for Tanh {
    fn forward(&self, input: &Variable) -> Variable {
        let data = input.data().mapv(f32::tanh);
        let forward_data = data.clone();
        elementwise(input, &self.hooks, data, move |grad| {
            let mut operand_gradient = Tensor::zeros(forward_data.raw_dim());
            Zip::from(&mut operand_gradient)
                .and(grad)
                .and(&forward_data)
                .for_each(|op_grad_el, &grad_el, &data_el| {
                    *op_grad_el = grad_el * (1. - data_el * data_el)
                });
            operand_gradient
        })
    }

    fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}

/// Applies the softplus function elementwise.
///
/// **softplus(x) = ln(1 + e^x)**
#[derive(Default)]
pub struct Softplus {
    hooks: Rc<Hooks>,
}

impl Softplus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for Softplus {
    fn forward(&self, input: &Variable) -> Variable {
        let operand_data = input.data().clone();
        let data = operand_data.mapv(|el| el.max(0.) + (-el.abs()).exp().ln_1p());
        elementwise(input, &self.hooks, data, move |grad| {
            let mut operand_gradient = Tensor::zeros(operand_data.raw_dim());
            Zip::from(&mut operand_gradient)
                .and(grad)
                .and(&operand_data)
                .for_each(|op_grad_el, &grad_el, &operand_el| {
                    *op_grad_el = grad_el / (1. + (-operand_el).exp())
                });
            operand_gradient
        })
    }

    fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}

/// Applies the leaky rectified linear unit elementwise.
///
/// **LeakyReLU(x) = max(0, x) + slope · min(0, x)**
pub struct LeakyReLU {
    slope: f32,
    hooks: Rc<Hooks>,
}

impl LeakyReLU {
    pub fn new(slope: f32) -> Self {
        Self {
            slope,
            hooks: Rc::default(),
        }
    }
}

impl Module for LeakyReLU {
    fn forward(&self, input: &Variable) -> Variable {
        let slope = self.slope;
        let operand_data = input.data().clone();
        let data = operand_data.mapv(|el| if el > 0. { el } else { slope * el });
        elementwise(input, &self.hooks, data, move |grad| {
            let mut operand_gradient = Tensor::zeros(operand_data.raw_dim());
            Zip::from(&mut operand_gradient)
                .and(grad)
                .and(&operand_data)
                .for_each(|op_grad_el, &grad_el, &operand_el| {
                    *op_grad_el = grad_el * if operand_el > 0. { 1. } else { slope }
                });
            operand_gradient
        })
    }

    fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}

/// Applies the rectified linear unit elementwise.
///
/// The in-place variant overwrites the input's data and marks it dirty.
#[derive(Default)]
pub struct ReLU {
    in_place: bool,
    hooks: Rc<Hooks>,
}

impl ReLU {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the module rectify its input in place.
    pub fn inplace(mut self) -> Self {
        self.in_place = true;
        self
    }
}

impl Module for ReLU {
    fn forward(&self, input: &Variable) -> Variable {
        let data = input.data().mapv(|el| el.max(0.));
        if self.in_place {
            input.data_mut().assign(&data);
            input.mark_dirty();
        }

        let forward_data = data.clone();
        elementwise(input, &self.hooks, data, move |grad| {
            let mut operand_gradient = Tensor::zeros(forward_data.raw_dim());
            Zip::from(&mut operand_gradient)
                .and(grad)
                .and(&forward_data)
                .for_each(|op_grad_el, &grad_el, &data_el| {
                    *op_grad_el = if data_el > 0. { grad_el } else { 0. }
                });
            operand_gradient
        })
    }

    fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}

// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ Linear ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

/// Applies a linear transformation to the incoming data.
///
/// **y = xA^T + b**
pub struct Linear {
    pub weight: Variable,
    pub bias: Variable,
    hooks: Rc<Hooks>,
}

impl Linear {
    /// Creates a linear layer.
    ///
    /// `in_features` – size of each input sample.
    ///
    /// `out_features` – size of each output sample.
    ///
    /// The learnable weight of the layer is of shape `(out_features,
    /// in_features)` and the learnable bias of shape `out_features`; both are
    /// initialised from **U(-k, k)** where `k = 1. / (in_features as
    /// f32).sqrt()`.
    pub fn new(in_features: usize, out_features: usize) -> Self {
        let weight = Variable::new(Tensor::zeros(vec![out_features, in_features]));
        let bias = Variable::new(Tensor::zeros(vec![out_features]));
        let k = (1. / in_features as f32).sqrt();
        init::uniform(&weight, -k, k);
        init::uniform(&bias, -k, k);

        Self {
            weight,
            bias,
            hooks: Rc::default(),
        }
    }
}

impl Module for Linear {
    /// Applies the linear transformation **y = xA^T + b** to the incoming
    /// data of shape `(N, in_features)`.
    fn forward(&self, input: &Variable) -> Variable {
        let input_data = input
            .data()
            .view()
            .into_dimensionality::<Ix2>()
            .expect("error: Linear expects a 2-dimensional input")
            .to_owned();
        let weight = self
            .weight
            .data()
            .view()
            .into_dimensionality::<Ix2>()
            .unwrap()
            .to_owned();

        let data = {
            let bias = self.bias.data();
            let bias = bias.view().into_dimensionality::<Ix1>().unwrap();
            (input_data.dot(&weight.t()) + &bias).into_dyn()
        };

        let output = Variable::from_op(
            data,
            &[input.clone(), self.weight.clone(), self.bias.clone()],
            move |grad| {
                let grad = grad.view().into_dimensionality::<Ix2>().unwrap();
                let operand_gradient = grad.dot(&weight).into_dyn();
                let weight_gradient = grad.t().dot(&input_data).into_dyn();
                let bias_gradient = grad.sum_axis(Axis(0)).into_dyn();
                Ok(vec![
                    Some(operand_gradient),
                    Some(weight_gradient),
                    Some(bias_gradient),
                ])
            },
            Some(Rc::clone(&self.hooks)),
        );
        self.hooks
            .notify_forward(std::slice::from_ref(input), &output);
        output
    }

    fn parameters(&self) -> Vec<Variable> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}
