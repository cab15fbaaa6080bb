use thiserror::Error;

/// Runtime failures of the backward pass.
///
/// Anything that is a programming error, such as constructing a layer with
/// invalid arguments or feeding it an input of the wrong rank, panics instead.
#[derive(Debug, Error)]
pub enum AutogradError {
    /// Backward was called on a volatile variable. Volatile variables record
    /// no backward graph, so there is nothing to differentiate.
    #[error("backward called on a volatile variable")]
    Volatile,
    /// Backward was called on a variable that neither requires a gradient nor
    /// resulted from a differentiable operation.
    #[error("variable does not require a gradient and has no backward function")]
    NoBackwardFunction,
    /// The indices returned by a pooling operation were mutated in place
    /// after the forward pass, so the gradient can no longer be routed
    /// through them.
    #[error("pooling indices were modified after the forward pass")]
    InvalidatedIndices,
    /// The upstream gradient does not match the shape of the variable it is
    /// being propagated through.
    #[error("gradient of shape {got:?} cannot be propagated through a variable of shape {expected:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
}
