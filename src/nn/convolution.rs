//! N-dimensional convolution layers.
//!
//! [`Conv1d`], [`Conv2d`] and [`Conv3d`] share a direct convolution kernel
//! over dynamically dimensioned tensors. Inputs follow the
//! `(batch, channels, spatial...)` convention; padding is zero padding.

use std::rc::Rc;

use ndarray::{ArrayViewD, ArrayViewMutD, Zip};

use super::utils::{next_index, sliding_out_dim};
use super::{init, Hooks, Module};
use crate::variable::{Tensor, Variable};

/// The shape of a convolution's output.
pub(crate) fn conv_out_shape(
    input_shape: &[usize],
    weight_shape: &[usize],
    stride: &[usize],
    padding: &[usize],
    dilation: &[usize],
) -> Vec<usize> {
    let mut shape = vec![input_shape[0], weight_shape[0]];
    shape.extend(
        input_shape[2..]
            .iter()
            .zip(&weight_shape[2..])
            .zip(stride)
            .zip(padding)
            .zip(dilation)
            .map(|((((&axis, &window), &stride), &padding), &dilation)| {
                sliding_out_dim(axis, window, padding, dilation, stride)
            }),
    );
    shape
}

fn conv_sample(
    out_sample: &mut ArrayViewMutD<f32>,
    in_sample: &ArrayViewD<f32>,
    weight: &Tensor,
    bias: &[f32],
    stride: &[usize],
    padding: &[usize],
    dilation: &[usize],
) {
    let out_channels = weight.shape()[0];
    let in_channels = weight.shape()[1];
    let kernel: Vec<usize> = weight.shape()[2..].to_vec();
    let spatial_out: Vec<usize> = out_sample.shape()[1..].to_vec();
    let spatial_in: Vec<usize> = in_sample.shape()[1..].to_vec();
    let spatial_dims = kernel.len();

    let mut out_index = vec![0; spatial_dims];
    let mut kernel_index = vec![0; spatial_dims];
    let mut in_index = vec![0; spatial_dims + 1];
    let mut weight_index = vec![0; spatial_dims + 2];
    let mut full_out_index = vec![0; spatial_dims + 1];

    loop {
        for out_channel in 0..out_channels {
            let mut acc = bias[out_channel];
            for in_channel in 0..in_channels {
                kernel_index.iter_mut().for_each(|el| *el = 0);
                loop {
                    let mut in_bounds = true;
                    for axis in 0..spatial_dims {
                        let coord = (out_index[axis] * stride[axis]
                            + kernel_index[axis] * dilation[axis])
                            as isize
                            - padding[axis] as isize;
                        if coord < 0 || coord >= spatial_in[axis] as isize {
                            in_bounds = false;
                            break;
                        }
                        in_index[axis + 1] = coord as usize;
                    }
                    if in_bounds {
                        in_index[0] = in_channel;
                        weight_index[0] = out_channel;
                        weight_index[1] = in_channel;
                        weight_index[2..].copy_from_slice(&kernel_index);
                        acc += in_sample[&in_index[..]] * weight[&weight_index[..]];
                    }
                    if !next_index(&mut kernel_index, &kernel) {
                        break;
                    }
                }
            }
            full_out_index[0] = out_channel;
            full_out_index[1..].copy_from_slice(&out_index);
            out_sample[&full_out_index[..]] = acc;
        }
        if !next_index(&mut out_index, &spatial_out) {
            break;
        }
    }
}

pub(crate) fn conv_forward(
    input: &Tensor,
    weight: &Tensor,
    bias: &Tensor,
    stride: &[usize],
    padding: &[usize],
    dilation: &[usize],
) -> Tensor {
    let out_shape = conv_out_shape(input.shape(), weight.shape(), stride, padding, dilation);
    let mut output = Tensor::zeros(out_shape);
    let bias = bias.as_slice().unwrap();

    Zip::from(output.outer_iter_mut())
        .and(input.outer_iter())
        .par_for_each(|mut out_sample, in_sample| {
            conv_sample(
                &mut out_sample,
                &in_sample,
                weight,
                bias,
                stride,
                padding,
                dilation,
            )
        });

    output
}

pub(crate) fn conv_backward(
    grad_output: &Tensor,
    input: &Tensor,
    weight: &Tensor,
    stride: &[usize],
    padding: &[usize],
    dilation: &[usize],
) -> (Tensor, Tensor, Tensor) {
    let batch_size = input.shape()[0];
    let out_channels = weight.shape()[0];
    let in_channels = weight.shape()[1];
    let kernel: Vec<usize> = weight.shape()[2..].to_vec();
    let spatial_in: Vec<usize> = input.shape()[2..].to_vec();
    let spatial_out: Vec<usize> = grad_output.shape()[2..].to_vec();
    let spatial_dims = kernel.len();

    let mut grad_input = Tensor::zeros(input.raw_dim());
    let mut grad_weight = Tensor::zeros(weight.raw_dim());
    let mut grad_bias = Tensor::zeros(vec![out_channels]);
    let bias_gradient = grad_bias.as_slice_mut().unwrap();

    let mut out_index = vec![0; spatial_dims];
    let mut kernel_index = vec![0; spatial_dims];
    let mut grad_out_index = vec![0; spatial_dims + 2];
    let mut in_index = vec![0; spatial_dims + 2];
    let mut weight_index = vec![0; spatial_dims + 2];

    for batch in 0..batch_size {
        out_index.iter_mut().for_each(|el| *el = 0);
        loop {
            for out_channel in 0..out_channels {
                grad_out_index[0] = batch;
                grad_out_index[1] = out_channel;
                grad_out_index[2..].copy_from_slice(&out_index);
                let grad_el = grad_output[&grad_out_index[..]];
                bias_gradient[out_channel] += grad_el;

                for in_channel in 0..in_channels {
                    kernel_index.iter_mut().for_each(|el| *el = 0);
                    loop {
                        let mut in_bounds = true;
                        for axis in 0..spatial_dims {
                            let coord = (out_index[axis] * stride[axis]
                                + kernel_index[axis] * dilation[axis])
                                as isize
                                - padding[axis] as isize;
                            if coord < 0 || coord >= spatial_in[axis] as isize {
                                in_bounds = false;
                                break;
                            }
                            in_index[axis + 2] = coord as usize;
                        }
                        if in_bounds {
                            in_index[0] = batch;
                            in_index[1] = in_channel;
                            weight_index[0] = out_channel;
                            weight_index[1] = in_channel;
                            weight_index[2..].copy_from_slice(&kernel_index);
                            grad_input[&in_index[..]] += grad_el * weight[&weight_index[..]];
                            grad_weight[&weight_index[..]] += grad_el * input[&in_index[..]];
                        }
                        if !next_index(&mut kernel_index, &kernel) {
                            break;
                        }
                    }
                }
            }
            if !next_index(&mut out_index, &spatial_out) {
                break;
            }
        }
    }

    (grad_input, grad_weight, grad_bias)
}

struct ConvNd {
    weight: Variable,
    bias: Variable,
    stride: Vec<usize>,
    padding: Vec<usize>,
    dilation: Vec<usize>,
    hooks: Rc<Hooks>,
}

impl ConvNd {
    fn new(in_channels: usize, out_channels: usize, kernel_size: &[usize]) -> Self {
        assert!(
            in_channels > 0 && out_channels > 0,
            "error: a convolution needs at least one input and one output channel."
        );
        assert!(
            kernel_size.iter().all(|&el| el > 0),
            "error: invalid kernel size {:?}.",
            kernel_size
        );

        let mut weight_shape = vec![out_channels, in_channels];
        weight_shape.extend_from_slice(kernel_size);
        let weight = Variable::new(Tensor::zeros(weight_shape));
        let bias = Variable::new(Tensor::zeros(vec![out_channels]));
        let fan_in = in_channels * kernel_size.iter().product::<usize>();
        let k = (1. / fan_in as f32).sqrt();
        init::uniform(&weight, -k, k);
        init::uniform(&bias, -k, k);

        let spatial_dims = kernel_size.len();
        Self {
            weight,
            bias,
            stride: vec![1; spatial_dims],
            padding: vec![0; spatial_dims],
            dilation: vec![1; spatial_dims],
            hooks: Rc::default(),
        }
    }

    fn forward(&self, input: &Variable) -> Variable {
        let spatial_dims = self.stride.len();
        assert_eq!(
            input.data().ndim(),
            spatial_dims + 2,
            "error: expected a {}-dimensional input of shape (batch, channels, space), got shape {:?}.",
            spatial_dims + 2,
            input.data().shape()
        );
        assert_eq!(
            input.data().shape()[1],
            self.weight.data().shape()[1],
            "error: input has {} channels but the layer expects {}.",
            input.data().shape()[1],
            self.weight.data().shape()[1]
        );

        let input_data = input.data().clone();
        let weight = self.weight.data().clone();
        let data = conv_forward(
            &input_data,
            &weight,
            &self.bias.data(),
            &self.stride,
            &self.padding,
            &self.dilation,
        );

        let (stride, padding, dilation) = (
            self.stride.clone(),
            self.padding.clone(),
            self.dilation.clone(),
        );
        let output = Variable::from_op(
            data,
            &[input.clone(), self.weight.clone(), self.bias.clone()],
            move |grad| {
                let (operand_gradient, weight_gradient, bias_gradient) =
                    conv_backward(grad, &input_data, &weight, &stride, &padding, &dilation);
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
}

macro_rules! convolution_layer {
    ($doc:expr, $name:ident, $dims:literal) => {
        #[doc = $doc]
        ///
        /// Stride defaults to 1, padding to 0 and dilation to 1 along every
        /// spatial axis. The learnable weight has shape `(out_channels,
        /// in_channels, kernel...)`; weight and bias are initialised from
        /// **U(-k, k)** with `k = 1. / (in_channels · ∏kernel).sqrt()`.
        pub struct $name {
            inner: ConvNd,
        }

        impl $name {
            pub fn new(
                in_channels: usize,
                out_channels: usize,
                kernel_size: [usize; $dims],
            ) -> Self {
                Self {
                    inner: ConvNd::new(in_channels, out_channels, &kernel_size),
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

            pub fn padding(mut self, padding: [usize; $dims]) -> Self {
                self.inner.padding = padding.to_vec();
                self
            }

            pub fn dilation(mut self, dilation: [usize; $dims]) -> Self {
                assert!(
                    dilation.iter().all(|&el| el > 0),
                    "error: invalid dilation {:?}.",
                    dilation
                );
                self.inner.dilation = dilation.to_vec();
                self
            }

            pub fn weight(&self) -> &Variable {
                &self.inner.weight
            }

            pub fn bias(&self) -> &Variable {
                &self.inner.bias
            }
        }

        impl Module for $name {
            fn forward(&self, input: &Variable) -> Variable {
                self.inner.forward(input)
            }

            fn parameters(&self) -> Vec<Variable> {
                vec![self.inner.weight.clone(), self.inner.bias.clone()]
            }

            fn hooks(&self) -> &Hooks {
                &self.inner.hooks
            }
        }
    };
}

convolution_layer!(
    "Applies a 1-dimensional convolution over an input of shape `(batch, channels, length)`.",
    Conv1d,
    1
);
convolution_layer!(
    "Applies a 2-dimensional convolution over an input of shape `(batch, channels, height, width)`.",
    Conv2d,
    2
);
convolution_layer!(
    "Applies a 3-dimensional convolution over an input of shape `(batch, channels, depth, height, width)`.",
    Conv3d,
    3
);
