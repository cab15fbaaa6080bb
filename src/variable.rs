//! Variables and the backward pass.
//!
//! A [`Variable`] is a cheaply clonable handle over a tensor, its accumulated
//! gradient and the backward function that produced it. Operations record a
//! single backward closure at construction; calling
//! [`.backward()`](Variable::backward) on an operation's output walks the
//! recorded closures towards the leaves, accumulating gradients along the way.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

use ndarray::ArrayD;

use crate::error::AutogradError;
use crate::nn::Hooks;

/// A dynamically dimensioned tensor of `f32` values.
pub type Tensor = ArrayD<f32>;

/// The gradients of an operation's inputs, given the gradient of its output.
///
/// An entry is `None` for inputs the operation is not differentiable with
/// respect to, such as the target of a loss.
type GradFn = dyn Fn(&Tensor) -> Result<Vec<Option<Tensor>>, AutogradError>;

/// A recorded differentiable operation.
struct Op {
    inputs: Vec<Variable>,
    grad_fn: Box<GradFn>,
    hooks: Option<Rc<Hooks>>,
}

impl Op {
    fn apply(&self, grad_output: &Tensor) -> Result<(), AutogradError> {
        let grads = (self.grad_fn)(grad_output)?;
        debug_assert_eq!(grads.len(), self.inputs.len());

        if let Some(hooks) = &self.hooks {
            let grad_inputs: Vec<Tensor> = grads.iter().flatten().cloned().collect();
            hooks.notify_backward(&grad_inputs, grad_output);
        }

        for (input, grad) in self.inputs.iter().zip(grads) {
            let grad = match grad {
                Some(grad) => grad,
                None => continue,
            };

            if input.requires_grad() {
                input.accumulate(&grad);
            }
            let parent = input.repr.op.borrow().clone();
            if let Some(parent) = parent {
                parent.apply(&grad)?;
            }
        }

        Ok(())
    }
}

struct Repr {
    data: RefCell<Tensor>,
    grad: RefCell<Option<Tensor>>,
    requires_grad: Cell<bool>,
    volatile: bool,
    version: Cell<usize>,
    dirty: Cell<bool>,
    op: RefCell<Option<Rc<Op>>>,
}

/// A tensor together with its gradient bookkeeping.
///
/// Cloning a variable is cheap and yields another handle to the same
/// underlying storage.
#[derive(Clone)]
pub struct Variable {
    repr: Rc<Repr>,
}

impl Variable {
    fn with_flags(data: Tensor, requires_grad: bool, volatile: bool) -> Self {
        Self {
            repr: Rc::new(Repr {
                data: RefCell::new(data),
                grad: RefCell::new(None),
                requires_grad: Cell::new(requires_grad),
                volatile,
                version: Cell::new(0),
                dirty: Cell::new(false),
                op: RefCell::new(None),
            }),
        }
    }

    /// Creates a gradient-requiring leaf.
    pub fn new(data: Tensor) -> Self {
        Self::with_flags(data, true, false)
    }

    /// Creates a leaf that does not require a gradient.
    pub fn detached(data: Tensor) -> Self {
        Self::with_flags(data, false, false)
    }

    /// Creates a volatile leaf.
    ///
    /// Every operation applied to a volatile variable produces a volatile
    /// result for which no backward graph is recorded.
    pub fn volatile(data: Tensor) -> Self {
        Self::with_flags(data, false, true)
    }

    /// Records the output of a differentiable operation over `inputs`.
    ///
    /// The output is volatile if any input is volatile, in which case no
    /// backward function is stored, and requires a gradient if any input
    /// does.
    pub(crate) fn from_op(
        data: Tensor,
        inputs: &[Variable],
        grad_fn: impl Fn(&Tensor) -> Result<Vec<Option<Tensor>>, AutogradError> + 'static,
        hooks: Option<Rc<Hooks>>,
    ) -> Self {
        let volatile = inputs.iter().any(Variable::is_volatile);
        let requires_grad = !volatile && inputs.iter().any(Variable::requires_grad);

        let variable = Self::with_flags(data, requires_grad, volatile);
        if requires_grad {
            *variable.repr.op.borrow_mut() = Some(Rc::new(Op {
                inputs: inputs.to_vec(),
                grad_fn: Box::new(grad_fn),
                hooks,
            }));
        }

        variable
    }

    /// Immutable view over the variable's data.
    pub fn data(&self) -> Ref<Tensor> {
        self.repr.data.borrow()
    }

    /// Mutable view over the variable's data.
    ///
    /// Meant for initialization and for the in-place perturbations of the
    /// numerical jacobian; unlike the `*_` operations it does not count as an
    /// external mutation.
    pub fn data_mut(&self) -> RefMut<Tensor> {
        self.repr.data.borrow_mut()
    }

    /// Immutable view over the accumulated gradient.
    ///
    /// # Panics
    ///
    /// If no gradient has been accumulated yet.
    pub fn grad(&self) -> Ref<Tensor> {
        Ref::map(self.repr.grad.borrow(), |grad| {
            grad.as_ref()
                .expect("no gradient has been accumulated for this variable")
        })
    }

    /// Whether a gradient has been accumulated.
    pub fn has_grad(&self) -> bool {
        self.repr.grad.borrow().is_some()
    }

    /// Resets the accumulated gradient to zero.
    pub fn zero_grad(&self) {
        let shape = self.repr.data.borrow().raw_dim();
        *self.repr.grad.borrow_mut() = Some(Tensor::zeros(shape));
    }

    pub fn requires_grad(&self) -> bool {
        self.repr.requires_grad.get()
    }

    pub fn is_volatile(&self) -> bool {
        self.repr.volatile
    }

    /// Whether the data has been mutated in place since creation.
    pub fn is_dirty(&self) -> bool {
        self.repr.dirty.get()
    }

    /// The number of in-place mutations the data has undergone.
    pub fn version(&self) -> usize {
        self.repr.version.get()
    }

    /// Fills the data with `value` in place.
    pub fn fill_(&self, value: f32) {
        self.repr.data.borrow_mut().fill(value);
        self.mark_dirty();
    }

    /// Adds `value` to every element in place.
    pub fn add_(&self, value: f32) {
        *self.repr.data.borrow_mut() += value;
        self.mark_dirty();
    }

    /// Multiplies every element by `value` in place.
    pub fn mul_(&self, value: f32) {
        *self.repr.data.borrow_mut() *= value;
        self.mark_dirty();
    }

    pub(crate) fn mark_dirty(&self) {
        self.repr.version.set(self.repr.version.get() + 1);
        self.repr.dirty.set(true);
    }

    fn accumulate(&self, grad: &Tensor) {
        let mut slot = self.repr.grad.borrow_mut();
        match &mut *slot {
            Some(accumulated) => *accumulated += grad,
            None => *slot = Some(grad.clone()),
        }
    }

    /// Runs the backward pass seeded with `grad_output`.
    ///
    /// Gradients accumulate into every gradient-requiring ancestor; callers
    /// that differentiate repeatedly are expected to zero them in between.
    pub fn backward(&self, grad_output: Tensor) -> Result<(), AutogradError> {
        if self.repr.volatile {
            return Err(AutogradError::Volatile);
        }
        if grad_output.shape() != self.repr.data.borrow().shape() {
            return Err(AutogradError::ShapeMismatch {
                expected: self.repr.data.borrow().shape().to_vec(),
                got: grad_output.shape().to_vec(),
            });
        }

        let op = self.repr.op.borrow().clone();
        match op {
            Some(op) => op.apply(&grad_output),
            None if self.requires_grad() => {
                self.accumulate(&grad_output);
                Ok(())
            }
            None => Err(AutogradError::NoBackwardFunction),
        }
    }
}

// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ Tests ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
#[cfg(test)]
mod test {
    use super::{Tensor, Variable};
    use crate::error::AutogradError;
    use ndarray::IxDyn;

    fn ones(shape: &[usize]) -> Tensor {
        Tensor::ones(IxDyn(shape))
    }

    fn double(input: &Variable) -> Variable {
        let data = input.data().mapv(|el| el * 2.);
        Variable::from_op(
            data,
            &[input.clone()],
            |grad| Ok(vec![Some(grad.mapv(|el| el * 2.))]),
            None,
        )
    }

    #[test]
    fn gradient_accumulation() {
        let leaf = Variable::new(ones(&[2, 3]));
        let output = double(&leaf);

        output.backward(ones(&[2, 3])).unwrap();
        assert_eq!(*leaf.grad(), ones(&[2, 3]) * 2.);

        output.backward(ones(&[2, 3])).unwrap();
        assert_eq!(*leaf.grad(), ones(&[2, 3]) * 4.);

        leaf.zero_grad();
        assert_eq!(*leaf.grad(), ones(&[2, 3]) * 0.);
    }

    #[test]
    fn chained_operations() {
        let leaf = Variable::new(ones(&[4]));
        let output = double(&double(&leaf));

        output.backward(ones(&[4])).unwrap();
        assert_eq!(*leaf.grad(), ones(&[4]) * 4.);
    }

    #[test]
    fn volatile_propagation() {
        let leaf = Variable::volatile(ones(&[2, 2]));
        let output = double(&leaf);

        assert!(output.is_volatile());
        assert!(!output.requires_grad());
        assert!(matches!(
            output.backward(ones(&[2, 2])),
            Err(AutogradError::Volatile)
        ));
    }

    #[test]
    fn detached_operand_records_no_backward_function() {
        let leaf = Variable::detached(ones(&[2]));
        let output = double(&leaf);

        assert!(!output.requires_grad());
        assert!(matches!(
            output.backward(ones(&[2])),
            Err(AutogradError::NoBackwardFunction)
        ));
    }

    #[test]
    fn gradient_shape_is_checked() {
        let leaf = Variable::new(ones(&[2, 3]));
        let output = double(&leaf);

        assert!(matches!(
            output.backward(ones(&[3, 2])),
            Err(AutogradError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn in_place_operations_bump_the_version() {
        let variable = Variable::new(ones(&[2]));
        assert_eq!(variable.version(), 0);
        assert!(!variable.is_dirty());

        variable.add_(1.);
        assert_eq!(variable.version(), 1);
        assert!(variable.is_dirty());
        assert_eq!(*variable.data(), ones(&[2]) * 2.);

        variable.fill_(0.5);
        variable.mul_(2.);
        assert_eq!(variable.version(), 3);
        assert_eq!(*variable.data(), ones(&[2]));
    }
}
