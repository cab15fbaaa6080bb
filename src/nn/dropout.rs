//! Dropout layers.
//!
//! During the forward pass each kept element is rescaled by `1 / (1 - p)`, so
//! the expected value of the output matches the input. [`Dropout`] draws an
//! independent mask entry per element, [`Dropout2d`] and [`Dropout3d`] zero
//! out whole channels at a time.

use std::rc::Rc;

use rand::thread_rng;
use rand_distr::{Distribution, Uniform};

use crate::variable::{Tensor, Variable};

use super::{elementwise, Hooks, Module};

/// A scaled elementwise keep-mask, one draw per element.
fn element_mask(shape: &[usize], p: f64) -> Tensor {
    let distr = Uniform::new(0., 1.);
    let mut rng = thread_rng();
    let scale = (1. / (1. - p)) as f32;

    let mut mask = Tensor::zeros(shape.to_vec());
    mask.map_inplace(|el| {
        *el = if distr.sample(&mut rng) >= p { scale } else { 0. }
    });
    mask
}

/// A scaled keep-mask with one draw per `(sample, channel)` pair, broadcast
/// over the spatial axes.
fn channel_mask(shape: &[usize], p: f64) -> Tensor {
    let distr = Uniform::new(0., 1.);
    let mut rng = thread_rng();
    let scale = (1. / (1. - p)) as f32;

    let mut mask = Tensor::zeros(shape.to_vec());
    for mut sample in mask.outer_iter_mut() {
        for mut channel in sample.outer_iter_mut() {
            let keep = distr.sample(&mut rng) >= p;
            channel.fill(if keep { scale } else { 0. });
        }
    }
    mask
}

struct DropoutNd {
    p: f64,
    in_place: bool,
    hooks: Rc<Hooks>,
}

impl DropoutNd {
    fn new(p: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&p),
            "error: dropout probability has to be between 0 and 1, but got {}.",
            p
        );
        Self {
            p,
            in_place: false,
            hooks: Rc::default(),
        }
    }

    fn forward(&self, input: &Variable, channel_wise: bool) -> Variable {
        let shape = input.data().shape().to_vec();
        let mask = if self.p <= f64::EPSILON {
            Tensor::ones(shape)
        } else if 1. - self.p <= f64::EPSILON {
            Tensor::zeros(shape)
        } else if channel_wise {
            channel_mask(&shape, self.p)
        } else {
            element_mask(&shape, self.p)
        };

        let data = &*input.data() * &mask;
        if self.in_place {
            input.data_mut().assign(&data);
            input.mark_dirty();
        }

        elementwise(input, &self.hooks, data, move |grad| grad * &mask)
    }
}

macro_rules! dropout_layer {
    ($doc:expr, $name:ident, $channel_wise:literal, $min_dims:literal) => {
        #[doc = $doc]
        pub struct $name {
            inner: DropoutNd,
        }

        impl $name {
            /// Creates the layer with drop probability `p`.
            ///
            /// # Panics
            ///
            /// If `p` is not between `0` and `1`.
            pub fn new(p: f64) -> Self {
                Self {
                    inner: DropoutNd::new(p),
                }
            }

            /// Makes the module overwrite its input's data, marking it dirty.
            pub fn inplace(mut self) -> Self {
                self.inner.in_place = true;
                self
            }
        }

        impl Module for $name {
            fn forward(&self, input: &Variable) -> Variable {
                assert!(
                    input.data().ndim() >= $min_dims,
                    "error: expected an input with at least {} dimensions, got shape {:?}.",
                    $min_dims,
                    input.data().shape()
                );
                self.inner.forward(input, $channel_wise)
            }

            fn hooks(&self) -> &Hooks {
                &self.inner.hooks
            }
        }
    };
}

dropout_layer!(
    "Zeroes elements of the input independently with probability `p`.",
    Dropout,
    false,
    1
);
dropout_layer!(
    "Zeroes entire channels of a `(batch, channels, height, width)` input \
     with probability `p`.",
    Dropout2d,
    true,
    4
);
dropout_layer!(
    "Zeroes entire channels of a `(batch, channels, depth, height, width)` \
     input with probability `p`.",
    Dropout3d,
    true,
    5
);

// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ Tests ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
#[cfg(test)]
mod test {
    use super::{Dropout, Dropout2d, Module};
    use crate::variable::{Tensor, Variable};
    use ndarray::IxDyn;

    #[test]
    fn zero_probability_is_the_identity() {
        let module = Dropout::new(0.);
        let input = Variable::new(Tensor::ones(IxDyn(&[5, 5])));

        let output = module.forward(&input);
        assert_eq!(*output.data(), *input.data());

        output.backward(Tensor::ones(IxDyn(&[5, 5]))).unwrap();
        assert_eq!(*input.grad(), Tensor::ones(IxDyn(&[5, 5])));
    }

    #[test]
    fn unit_probability_drops_everything() {
        let module = Dropout::new(1.);
        let input = Variable::new(Tensor::ones(IxDyn(&[5, 5])));

        let output = module.forward(&input);
        assert_eq!(*output.data(), Tensor::zeros(IxDyn(&[5, 5])));

        output.backward(Tensor::ones(IxDyn(&[5, 5]))).unwrap();
        assert_eq!(*input.grad(), Tensor::zeros(IxDyn(&[5, 5])));
    }

    #[test]
    fn kept_elements_are_rescaled() {
        let module = Dropout::new(0.5);
        let input = Variable::new(Tensor::ones(IxDyn(&[20, 20])));

        let output = module.forward(&input);
        assert!(output.data().iter().all(|&el| el == 0. || el == 2.));
    }

    #[test]
    fn channels_are_dropped_whole() {
        let module = Dropout2d::new(0.5);
        let input = Variable::new(Tensor::ones(IxDyn(&[4, 8, 3, 3])));

        let output = module.forward(&input);
        for sample in output.data().outer_iter() {
            for channel in sample.outer_iter() {
                let first = channel[[0, 0]];
                assert!(first == 0. || first == 2.);
                assert!(channel.iter().all(|&el| el == first));
            }
        }
    }

    #[test]
    #[should_panic]
    fn out_of_range_probability() {
        Dropout::new(1.5);
    }
}
