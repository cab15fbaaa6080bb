//! N-dimensional max and average pooling layers.
//!
//! Pooling slides a window over the spatial axes of a `(batch, channels,
//! spatial...)` input. Max pooling can additionally return the argmax
//! positions as flat per-channel spatial offsets; those indices are part of
//! the operation's backward bookkeeping and become unusable once mutated.

use std::rc::Rc;

use crate::error::AutogradError;
use crate::variable::{Tensor, Variable};

use super::utils::{next_index, sliding_out_dim};
use super::{Hooks, Module};

fn pool_out_shape(
    input_shape: &[usize],
    kernel: &[usize],
    stride: &[usize],
    padding: &[usize],
) -> Vec<usize> {
    let mut shape = vec![input_shape[0], input_shape[1]];
    shape.extend(
        input_shape[2..]
            .iter()
            .zip(kernel)
            .zip(stride)
            .zip(padding)
            .map(|(((&axis, &window), &stride), &padding)| {
                sliding_out_dim(axis, window, padding, 1, stride)
            }),
    );
    shape
}

/// Row-major strides of a spatial extent, for flattening coordinates.
fn flat_strides(spatial: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; spatial.len()];
    for axis in (0..spatial.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * spatial[axis + 1];
    }
    strides
}

pub(crate) fn max_pool_forward(
    input: &Tensor,
    kernel: &[usize],
    stride: &[usize],
    padding: &[usize],
) -> (Tensor, Tensor) {
    let out_shape = pool_out_shape(input.shape(), kernel, stride, padding);
    let mut output = Tensor::zeros(out_shape.clone());
    let mut indices = Tensor::zeros(out_shape);

    let spatial_in: Vec<usize> = input.shape()[2..].to_vec();
    let strides_in = flat_strides(&spatial_in);
    let spatial_dims = kernel.len();

    for ((mut out_sample, mut idx_sample), in_sample) in output
        .outer_iter_mut()
        .zip(indices.outer_iter_mut())
        .zip(input.outer_iter())
    {
        for ((mut out_channel, mut idx_channel), in_channel) in out_sample
            .outer_iter_mut()
            .zip(idx_sample.outer_iter_mut())
            .zip(in_sample.outer_iter())
        {
            let spatial_out: Vec<usize> = out_channel.shape().to_vec();
            let mut out_index = vec![0; spatial_dims];
            let mut kernel_index = vec![0; spatial_dims];
            let mut coords = vec![0; spatial_dims];

            loop {
                // Out-of-bounds window positions behave as negative infinity,
                // so the argmax always names a real input element.
                let mut best = f32::NEG_INFINITY;
                let mut best_flat = 0;
                kernel_index.iter_mut().for_each(|el| *el = 0);
                loop {
                    let mut in_bounds = true;
                    for axis in 0..spatial_dims {
                        let coord = (out_index[axis] * stride[axis] + kernel_index[axis]) as isize
                            - padding[axis] as isize;
                        if coord < 0 || coord >= spatial_in[axis] as isize {
                            in_bounds = false;
                            break;
                        }
                        coords[axis] = coord as usize;
                    }
                    if in_bounds {
                        let el = in_channel[&coords[..]];
                        if el > best {
                            best = el;
                            best_flat = coords
                                .iter()
                                .zip(&strides_in)
                                .map(|(&coord, &stride)| coord * stride)
                                .sum();
                        }
                    }
                    if !next_index(&mut kernel_index, kernel) {
                        break;
                    }
                }
                out_channel[&out_index[..]] = best;
                idx_channel[&out_index[..]] = best_flat as f32;
                if !next_index(&mut out_index, &spatial_out) {
                    break;
                }
            }
        }
    }

    (output, indices)
}

pub(crate) fn max_pool_backward(
    grad_output: &Tensor,
    indices: &Tensor,
    input_shape: &[usize],
) -> Tensor {
    let mut grad_input = Tensor::zeros(input_shape.to_vec());
    let spatial_in: Vec<usize> = input_shape[2..].to_vec();
    let strides_in = flat_strides(&spatial_in);
    let spatial_dims = spatial_in.len();

    for ((mut grad_in_sample, grad_out_sample), idx_sample) in grad_input
        .outer_iter_mut()
        .zip(grad_output.outer_iter())
        .zip(indices.outer_iter())
    {
        for ((mut grad_in_channel, grad_out_channel), idx_channel) in grad_in_sample
            .outer_iter_mut()
            .zip(grad_out_sample.outer_iter())
            .zip(idx_sample.outer_iter())
        {
            let spatial_out: Vec<usize> = grad_out_channel.shape().to_vec();
            let mut out_index = vec![0; spatial_dims];
            let mut coords = vec![0; spatial_dims];

            loop {
                let flat = idx_channel[&out_index[..]] as usize;
                for axis in 0..spatial_dims {
                    coords[axis] = flat / strides_in[axis] % spatial_in[axis];
                }
                grad_in_channel[&coords[..]] += grad_out_channel[&out_index[..]];
                if !next_index(&mut out_index, &spatial_out) {
                    break;
                }
            }
        }
    }

    grad_input
}

pub(crate) fn avg_pool_forward(
    input: &Tensor,
    kernel: &[usize],
    stride: &[usize],
    padding: &[usize],
) -> Tensor {
    let out_shape = pool_out_shape(input.shape(), kernel, stride, padding);
    let mut output = Tensor::zeros(out_shape);
    let spatial_in: Vec<usize> = input.shape()[2..].to_vec();
    let spatial_dims = kernel.len();
    let divisor = kernel.iter().product::<usize>() as f32;

    for (mut out_sample, in_sample) in output.outer_iter_mut().zip(input.outer_iter()) {
        for (mut out_channel, in_channel) in
            out_sample.outer_iter_mut().zip(in_sample.outer_iter())
        {
            let spatial_out: Vec<usize> = out_channel.shape().to_vec();
            let mut out_index = vec![0; spatial_dims];
            let mut kernel_index = vec![0; spatial_dims];
            let mut coords = vec![0; spatial_dims];

            loop {
                let mut acc = 0.;
                kernel_index.iter_mut().for_each(|el| *el = 0);
                loop {
                    let mut in_bounds = true;
                    for axis in 0..spatial_dims {
                        let coord = (out_index[axis] * stride[axis] + kernel_index[axis]) as isize
                            - padding[axis] as isize;
                        if coord < 0 || coord >= spatial_in[axis] as isize {
                            in_bounds = false;
                            break;
                        }
                        coords[axis] = coord as usize;
                    }
                    if in_bounds {
                        acc += in_channel[&coords[..]];
                    }
                    if !next_index(&mut kernel_index, kernel) {
                        break;
                    }
                }
                out_channel[&out_index[..]] = acc / divisor;
                if !next_index(&mut out_index, &spatial_out) {
                    break;
                }
            }
        }
    }

    output
}

pub(crate) fn avg_pool_backward(
    grad_output: &Tensor,
    input_shape: &[usize],
    kernel: &[usize],
    stride: &[usize],
    padding: &[usize],
) -> Tensor {
    let mut grad_input = Tensor::zeros(input_shape.to_vec());
    let spatial_in: Vec<usize> = input_shape[2..].to_vec();
    let spatial_dims = kernel.len();
    let divisor = kernel.iter().product::<usize>() as f32;

    for (mut grad_in_sample, grad_out_sample) in
        grad_input.outer_iter_mut().zip(grad_output.outer_iter())
    {
        for (mut grad_in_channel, grad_out_channel) in grad_in_sample
            .outer_iter_mut()
            .zip(grad_out_sample.outer_iter())
        {
            let spatial_out: Vec<usize> = grad_out_channel.shape().to_vec();
            let mut out_index = vec![0; spatial_dims];
            let mut kernel_index = vec![0; spatial_dims];
            let mut coords = vec![0; spatial_dims];

            loop {
                let grad_el = grad_out_channel[&out_index[..]] / divisor;
                kernel_index.iter_mut().for_each(|el| *el = 0);
                loop {
                    let mut in_bounds = true;
                    for axis in 0..spatial_dims {
                        let coord = (out_index[axis] * stride[axis] + kernel_index[axis]) as isize
                            - padding[axis] as isize;
                        if coord < 0 || coord >= spatial_in[axis] as isize {
                            in_bounds = false;
                            break;
                        }
                        coords[axis] = coord as usize;
                    }
                    if in_bounds {
                        grad_in_channel[&coords[..]] += grad_el;
                    }
                    if !next_index(&mut kernel_index, kernel) {
                        break;
                    }
                }
                if !next_index(&mut out_index, &spatial_out) {
                    break;
                }
            }
        }
    }

    grad_input
}

struct MaxPoolNd {
    kernel: Vec<usize>,
    stride: Vec<usize>,
    padding: Vec<usize>,
    hooks: Rc<Hooks>,
}

impl MaxPoolNd {
    fn new(kernel: &[usize]) -> Self {
        assert!(
            kernel.iter().all(|&el| el > 0),
            "error: invalid pool shape {:?}.",
            kernel
        );
        Self {
            kernel: kernel.to_vec(),
            stride: kernel.to_vec(),
            padding: vec![0; kernel.len()],
            hooks: Rc::default(),
        }
    }

    /// Pools `input` and returns the output together with the argmax
    /// positions, recorded as flat per-channel spatial offsets.
    ///
    /// The indices do not require a gradient. The backward pass routes the
    /// upstream gradient through them and refuses to run if they have been
    /// mutated in place since the forward pass.
    fn forward_with_indices(&self, input: &Variable) -> (Variable, Variable) {
        assert_eq!(
            input.data().ndim(),
            self.kernel.len() + 2,
            "error: invalid pool shape {:?} for an input of shape {:?}.",
            self.kernel,
            input.data().shape()
        );

        let input_shape = input.data().shape().to_vec();
        let (out_data, idx_data) =
            max_pool_forward(&input.data(), &self.kernel, &self.stride, &self.padding);

        let indices = Variable::detached(idx_data);
        let recorded = indices.clone();
        let recorded_version = indices.version();
        let output = Variable::from_op(
            out_data,
            std::slice::from_ref(input),
            move |grad| {
                if recorded.version() != recorded_version {
                    return Err(AutogradError::InvalidatedIndices);
                }
                Ok(vec![Some(max_pool_backward(
                    grad,
                    &recorded.data(),
                    &input_shape,
                ))])
            },
            Some(Rc::clone(&self.hooks)),
        );
        self.hooks
            .notify_forward(std::slice::from_ref(input), &output);
        (output, indices)
    }
}

struct AvgPoolNd {
    kernel: Vec<usize>,
    stride: Vec<usize>,
    padding: Vec<usize>,
    hooks: Rc<Hooks>,
}

impl AvgPoolNd {
    fn new(kernel: &[usize]) -> Self {
        assert!(
            kernel.iter().all(|&el| el > 0),
            "error: invalid pool shape {:?}.",
            kernel
        );
        Self {
            kernel: kernel.to_vec(),
            stride: kernel.to_vec(),
            padding: vec![0; kernel.len()],
            hooks: Rc::default(),
        }
    }

    fn forward(&self, input: &Variable) -> Variable {
        assert_eq!(
            input.data().ndim(),
            self.kernel.len() + 2,
            "error: invalid pool shape {:?} for an input of shape {:?}.",
            self.kernel,
            input.data().shape()
        );

        let input_shape = input.data().shape().to_vec();
        let data = avg_pool_forward(&input.data(), &self.kernel, &self.stride, &self.padding);

        let (kernel, stride, padding) = (
            self.kernel.clone(),
            self.stride.clone(),
            self.padding.clone(),
        );
        let output = Variable::from_op(
            data,
            std::slice::from_ref(input),
            move |grad| {
                Ok(vec![Some(avg_pool_backward(
                    grad,
                    &input_shape,
                    &kernel,
                    &stride,
                    &padding,
                ))])
            },
            Some(Rc::clone(&self.hooks)),
        );
        self.hooks
            .notify_forward(std::slice::from_ref(input), &output);
        output
    }
}

pub(crate) fn max_unpool_forward(
    input: &Tensor,
    indices: &Tensor,
    out_shape: &[usize],
) -> Tensor {
    let mut output = Tensor::zeros(out_shape.to_vec());
    let spatial_out: Vec<usize> = out_shape[2..].to_vec();
    let strides_out = flat_strides(&spatial_out);
    let spatial_numel: usize = spatial_out.iter().product();
    let spatial_dims = spatial_out.len();

    for ((mut out_sample, in_sample), idx_sample) in output
        .outer_iter_mut()
        .zip(input.outer_iter())
        .zip(indices.outer_iter())
    {
        for ((mut out_channel, in_channel), idx_channel) in out_sample
            .outer_iter_mut()
            .zip(in_sample.outer_iter())
            .zip(idx_sample.outer_iter())
        {
            let spatial_in: Vec<usize> = in_channel.shape().to_vec();
            let mut in_index = vec![0; spatial_dims];
            let mut coords = vec![0; spatial_dims];

            loop {
                let flat = idx_channel[&in_index[..]] as usize;
                assert!(
                    flat < spatial_numel,
                    "error: unpooling index {} is out of bounds for an output of shape {:?}.",
                    flat,
                    spatial_out
                );
                for axis in 0..spatial_dims {
                    coords[axis] = flat / strides_out[axis] % spatial_out[axis];
                }
                out_channel[&coords[..]] = in_channel[&in_index[..]];
                if !next_index(&mut in_index, &spatial_in) {
                    break;
                }
            }
        }
    }

    output
}

pub(crate) fn max_unpool_backward(
    grad_output: &Tensor,
    indices: &Tensor,
    input_shape: &[usize],
) -> Tensor {
    let mut grad_input = Tensor::zeros(input_shape.to_vec());
    let spatial_out: Vec<usize> = grad_output.shape()[2..].to_vec();
    let strides_out = flat_strides(&spatial_out);
    let spatial_dims = spatial_out.len();

    for ((mut grad_in_sample, grad_out_sample), idx_sample) in grad_input
        .outer_iter_mut()
        .zip(grad_output.outer_iter())
        .zip(indices.outer_iter())
    {
        for ((mut grad_in_channel, grad_out_channel), idx_channel) in grad_in_sample
            .outer_iter_mut()
            .zip(grad_out_sample.outer_iter())
            .zip(idx_sample.outer_iter())
        {
            let spatial_in: Vec<usize> = grad_in_channel.shape().to_vec();
            let mut in_index = vec![0; spatial_dims];
            let mut coords = vec![0; spatial_dims];

            loop {
                let flat = idx_channel[&in_index[..]] as usize;
                for axis in 0..spatial_dims {
                    coords[axis] = flat / strides_out[axis] % spatial_out[axis];
                }
                grad_in_channel[&in_index[..]] = grad_out_channel[&coords[..]];
                if !next_index(&mut in_index, &spatial_in) {
                    break;
                }
            }
        }
    }

    grad_input
}

struct MaxUnpoolNd {
    kernel: Vec<usize>,
    stride: Vec<usize>,
    padding: Vec<usize>,
    hooks: Rc<Hooks>,
}

impl MaxUnpoolNd {
    fn new(kernel: &[usize]) -> Self {
        assert!(
            kernel.iter().all(|&el| el > 0),
            "error: invalid pool shape {:?}.",
            kernel
        );
        Self {
            kernel: kernel.to_vec(),
            stride: kernel.to_vec(),
            padding: vec![0; kernel.len()],
            hooks: Rc::default(),
        }
    }

    fn out_shape(&self, input_shape: &[usize]) -> Vec<usize> {
        let mut shape = vec![input_shape[0], input_shape[1]];
        shape.extend(
            input_shape[2..]
                .iter()
                .zip(&self.kernel)
                .zip(&self.stride)
                .zip(&self.padding)
                .map(|(((&axis, &window), &stride), &padding)| {
                    (axis - 1) * stride + window - 2 * padding
                }),
        );
        shape
    }

    /// Scatters `input` into a zero tensor at the positions named by
    /// `indices`, undoing the spatial reduction of the matching max pool.
    ///
    /// The indices are read at forward time; the backward pass gathers the
    /// upstream gradient from the same positions.
    fn forward(&self, input: &Variable, indices: &Variable) -> Variable {
        assert_eq!(
            input.data().ndim(),
            self.kernel.len() + 2,
            "error: invalid pool shape {:?} for an input of shape {:?}.",
            self.kernel,
            input.data().shape()
        );
        assert_eq!(
            input.data().shape(),
            indices.data().shape(),
            "error: input of shape {:?} does not match indices of shape {:?}.",
            input.data().shape(),
            indices.data().shape()
        );

        let input_shape = input.data().shape().to_vec();
        let out_shape = self.out_shape(&input_shape);
        let data = max_unpool_forward(&input.data(), &indices.data(), &out_shape);

        let idx_data = indices.data().clone();
        let inputs = [input.clone(), indices.clone()];
        let output = Variable::from_op(
            data,
            &inputs,
            move |grad| {
                Ok(vec![
                    Some(max_unpool_backward(grad, &idx_data, &input_shape)),
                    None,
                ])
            },
            Some(Rc::clone(&self.hooks)),
        );
        self.hooks.notify_forward(&inputs, &output);
        output
    }
}

macro_rules! max_pool_layer {
    ($doc:expr, $name:ident, $dims:literal) => {
        #[doc = $doc]
        ///
        /// Stride defaults to the kernel size; padding pads with negative
        /// infinity, so it never wins the max.
        pub struct $name {
            inner: MaxPoolNd,
        }

        impl $name {
            pub fn new(kernel_size: [usize; $dims]) -> Self {
                Self {
                    inner: MaxPoolNd::new(&kernel_size),
                }
            }

            pub fn stride(mut self, stride: [usize; $dims]) -> Self {
                assert!(
                    stride.iter().all(|&el| el > 0),
                    "error: invalid stride {:?}.",
                    stride
                );
                self.inner.stride = stride.to_vec();
                self
            }

            /// # Panics
            ///
            /// If any padding exceeds half the window, which would let a
            /// window lie entirely in padding.
            pub fn padding(mut self, padding: [usize; $dims]) -> Self {
                assert!(
                    padding
                        .iter()
                        .zip(&self.inner.kernel)
                        .all(|(&padding, &window)| 2 * padding <= window),
                    "error: padding {:?} must be at most half the window {:?}.",
                    padding,
                    self.inner.kernel
                );
                self.inner.padding = padding.to_vec();
                self
            }

            /// Pools `input`, additionally returning the argmax indices.
            pub fn forward_with_indices(&self, input: &Variable) -> (Variable, Variable) {
                self.inner.forward_with_indices(input)
            }
        }

        impl Module for $name {
            fn forward(&self, input: &Variable) -> Variable {
                self.inner.forward_with_indices(input).0
            }

            fn hooks(&self) -> &Hooks {
                &self.inner.hooks
            }
        }
    };
}

macro_rules! avg_pool_layer {
    ($doc:expr, $name:ident, $dims:literal) => {
        #[doc = $doc]
        ///
        /// Stride defaults to the kernel size. The divisor is the window
        /// size, padded positions included.
        pub struct $name {
            inner: AvgPoolNd,
        }

        impl $name {
            pub fn new(kernel_size: [usize; $dims]) -> Self {
                Self {
                    inner: AvgPoolNd::new(&kernel_size),
                }
            }

            pub fn stride(mut self, stride: [usize; $dims]) -> Self {
                assert!(
                    stride.iter().all(|&el| el > 0),
                    "error: invalid stride {:?}.",
                    stride
                );
                self.inner.stride = stride.to_vec();
                self
            }

            /// # Panics
            ///
            /// If any padding exceeds half the window, which would let a
            /// window lie entirely in padding.
            pub fn padding(mut self, padding: [usize; $dims]) -> Self {
                assert!(
                    padding
                        .iter()
                        .zip(&self.inner.kernel)
                        .all(|(&padding, &window)| 2 * padding <= window),
                    "error: padding {:?} must be at most half the window {:?}.",
                    padding,
                    self.inner.kernel
                );
                self.inner.padding = padding.to_vec();
                self
            }
        }

        impl Module for $name {
            fn forward(&self, input: &Variable) -> Variable {
                self.inner.forward(input)
            }

            fn hooks(&self) -> &Hooks {
                &self.inner.hooks
            }
        }
    };
}

macro_rules! max_unpool_layer {
    ($doc:expr, $name:ident, $dims:literal) => {
        #[doc = $doc]
        ///
        /// The inverse of the matching max pool: takes the pooled values and
        /// the indices returned by
        /// [`forward_with_indices`](MaxPool1d::forward_with_indices) and
        /// scatters the values back to their original positions, filling the
        /// rest with zeros. Stride defaults to the kernel size. Not a
        /// [`Module`]: the forward pass needs the indices as a second
        /// argument.
        pub struct $name {
            inner: MaxUnpoolNd,
        }

        impl $name {
            pub fn new(kernel_size: [usize; $dims]) -> Self {
                Self {
                    inner: MaxUnpoolNd::new(&kernel_size),
                }
            }

            pub fn stride(mut self, stride: [usize; $dims]) -> Self {
                assert!(
                    stride.iter().all(|&el| el > 0),
                    "error: invalid stride {:?}.",
                    stride
                );
                self.inner.stride = stride.to_vec();
                self
            }

            /// # Panics
            ///
            /// If any padding exceeds half the window, which would let a
            /// window lie entirely in padding.
            pub fn padding(mut self, padding: [usize; $dims]) -> Self {
                assert!(
                    padding
                        .iter()
                        .zip(&self.inner.kernel)
                        .all(|(&padding, &window)| 2 * padding <= window),
                    "error: padding {:?} must be at most half the window {:?}.",
                    padding,
                    self.inner.kernel
                );
                self.inner.padding = padding.to_vec();
                self
            }

            pub fn forward(&self, input: &Variable, indices: &Variable) -> Variable {
                self.inner.forward(input, indices)
            }

            pub fn hooks(&self) -> &Hooks {
                &self.inner.hooks
            }
        }
    };
}

max_pool_layer!("Applies 1-dimensional max pooling.", MaxPool1d, 1);
max_pool_layer!("Applies 2-dimensional max pooling.", MaxPool2d, 2);
max_pool_layer!("Applies 3-dimensional max pooling.", MaxPool3d, 3);
avg_pool_layer!("Applies 1-dimensional average pooling.", AvgPool1d, 1);
avg_pool_layer!("Applies 2-dimensional average pooling.", AvgPool2d, 2);
avg_pool_layer!("Applies 3-dimensional average pooling.", AvgPool3d, 3);
max_unpool_layer!("Undoes 1-dimensional max pooling.", MaxUnpool1d, 1);
max_unpool_layer!("Undoes 2-dimensional max pooling.", MaxUnpool2d, 2);
max_unpool_layer!("Undoes 3-dimensional max pooling.", MaxUnpool3d, 3);

// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ Tests ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
#[cfg(test)]
mod test {
    use super::{AvgPool2d, MaxPool1d, MaxPool2d, MaxUnpool1d, MaxUnpool2d, Module};
    use crate::error::AutogradError;
    use crate::variable::{Tensor, Variable};
    use ndarray::{array, IxDyn};

    fn ramp(shape: &[usize]) -> Tensor {
        let numel: usize = shape.iter().product();
        Tensor::from_shape_vec(IxDyn(shape), (1..=numel).map(|el| el as f32).collect()).unwrap()
    }

    #[test]
    fn max_pool_values_and_indices() {
        let module = MaxPool2d::new([2, 2]);
        let input = Variable::new(ramp(&[1, 1, 4, 4]));

        let (output, indices) = module.forward_with_indices(&input);
        assert_eq!(
            output.data().as_slice().unwrap(),
            [6., 8., 14., 16.]
        );
        assert_eq!(
            indices.data().as_slice().unwrap(),
            [5., 7., 13., 15.]
        );
        assert!(output.requires_grad());
        assert!(!indices.requires_grad());
    }

    #[test]
    fn max_pool_routes_the_gradient_to_the_argmax() {
        let module = MaxPool2d::new([2, 2]);
        let input = Variable::new(ramp(&[1, 1, 4, 4]));

        let output = module.forward(&input);
        output.backward(Tensor::ones(IxDyn(&[1, 1, 2, 2]))).unwrap();

        let grad = input.grad();
        let expected = [
            0., 0., 0., 0., //
            0., 1., 0., 1., //
            0., 0., 0., 0., //
            0., 1., 0., 1.,
        ];
        assert_eq!(grad.as_slice().unwrap(), expected);
    }

    #[test]
    fn mutated_indices_invalidate_the_backward_pass() {
        let module = MaxPool2d::new([2, 2]);
        let input = Variable::new(ramp(&[1, 1, 4, 4]));

        let (output, indices) = module.forward_with_indices(&input);
        indices.add_(1.);

        assert!(matches!(
            output.backward(Tensor::ones(IxDyn(&[1, 1, 2, 2]))),
            Err(AutogradError::InvalidatedIndices)
        ));
    }

    #[test]
    #[should_panic]
    fn oversized_padding() {
        MaxPool2d::new([2, 2]).padding([2, 2]);
    }

    #[test]
    fn max_unpool_scatters_to_the_recorded_positions() {
        let pool = MaxPool1d::new([2]);
        let unpool = MaxUnpool1d::new([2]);
        let input = Variable::new(ramp(&[1, 1, 4]));

        let (pooled, indices) = pool.forward_with_indices(&input);
        let unpooled = unpool.forward(&pooled, &indices);
        assert_eq!(
            *unpooled.data(),
            array![[[0.0_f32, 2., 0., 4.]]].into_dyn()
        );

        unpooled.backward(Tensor::ones(IxDyn(&[1, 1, 4]))).unwrap();
        assert_eq!(*input.grad(), array![[[0.0_f32, 1., 0., 1.]]].into_dyn());
    }

    #[test]
    fn max_unpool_restores_the_spatial_extent() {
        let pool = MaxPool2d::new([2, 2]);
        let unpool = MaxUnpool2d::new([2, 2]);
        let input = Variable::new(ramp(&[1, 1, 4, 4]));

        let (pooled, indices) = pool.forward_with_indices(&input);
        let unpooled = unpool.forward(&pooled, &indices);
        assert_eq!(unpooled.data().shape(), input.data().shape());

        // Scattered values survive, everything else is zeroed.
        let expected = [
            0., 0., 0., 0., //
            0., 6., 0., 8., //
            0., 0., 0., 0., //
            0., 14., 0., 16.,
        ];
        assert_eq!(unpooled.data().as_slice().unwrap(), expected);
    }

    #[test]
    #[should_panic]
    fn max_unpool_rejects_out_of_bounds_indices() {
        let unpool = MaxUnpool1d::new([2]);
        let pooled = Variable::new(array![[[2.0_f32, 4.]]].into_dyn());
        let indices = Variable::detached(array![[[1.0_f32, 9.]]].into_dyn());
        unpool.forward(&pooled, &indices);
    }

    #[test]
    fn avg_pool_gradient_is_uniform() {
        let module = AvgPool2d::new([2, 2]);
        let input = Variable::new(ramp(&[1, 1, 4, 4]));

        let output = module.forward(&input);
        assert_eq!(
            output.data().as_slice().unwrap(),
            [3.5, 5.5, 11.5, 13.5]
        );

        output.backward(Tensor::ones(IxDyn(&[1, 1, 2, 2]))).unwrap();
        assert!(input.grad().iter().all(|&el| el == 0.25));
    }
}
