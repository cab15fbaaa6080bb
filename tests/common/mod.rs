//! Shared driver for the table-driven layer and criterion suites.
//!
//! Each case names a constructor and an input shape; the driver builds the
//! module, runs a forward and a backward pass, compares the backward results
//! against a finite-difference jacobian and, where a case declares an
//! in-place twin, checks that the twin overwrites its input with the plain
//! variant's output.
//!
//! Inputs are deterministic: a shuffled grid of evenly spaced values over
//! `(-1, 1)`. The grid keeps every element away from zero and every pair of
//! elements apart, so rectifier kinks and pooling argmax ties stay clear of
//! the finite-difference perturbation.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};

use ndarray::IxDyn;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use tensorika::gradcheck::check_gradients;
use tensorika::nn::loss::Criterion;
use tensorika::nn::Module;
use tensorika::variable::{Tensor, Variable};

/// A tensor whose elements are a shuffled permutation of the grid
/// `-1 + (2i + 1) / divisor`, pairwise separated by at least `2 / divisor`.
///
/// The divisor is `numel` rounded up to even: an odd numerator over an even
/// divisor is never zero, so the grid cannot land on a kink at the origin.
pub fn spread_input(shape: &[usize], seed: u64) -> Tensor {
    let numel: usize = shape.iter().product();
    let divisor = numel + numel % 2;
    let mut values: Vec<f32> = (0..numel)
        .map(|i| -1. + (2 * i + 1) as f32 / divisor as f32)
        .collect();
    values.shuffle(&mut StdRng::seed_from_u64(seed));
    Tensor::from_shape_vec(IxDyn(shape), values).unwrap()
}

fn case_seed(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

fn describe_panic(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "non-string panic payload".to_string()
    }
}

type ModuleBuilder = Box<dyn Fn() -> Box<dyn Module>>;

pub struct ModuleCase {
    name: &'static str,
    build: ModuleBuilder,
    build_in_place: Option<ModuleBuilder>,
    input_shape: Vec<usize>,
    literal_input: Option<Tensor>,
    check_jacobian: bool,
}

impl ModuleCase {
    pub fn new<M, F>(name: &'static str, input_shape: &[usize], build: F) -> Self
    where
        M: Module + 'static,
        F: Fn() -> M + 'static,
    {
        Self {
            name,
            build: Box::new(move || Box::new(build())),
            build_in_place: None,
            input_shape: input_shape.to_vec(),
            literal_input: None,
            check_jacobian: true,
        }
    }

    /// Declares an in-place twin whose forward must overwrite its input with
    /// the plain variant's output.
    pub fn in_place_twin<M, F>(mut self, build: F) -> Self
    where
        M: Module + 'static,
        F: Fn() -> M + 'static,
    {
        self.build_in_place = Some(Box::new(move || Box::new(build())));
        self
    }

    /// Replaces the generated input with a literal tensor.
    pub fn with_input(mut self, input: Tensor) -> Self {
        self.literal_input = Some(input);
        self
    }

    /// Skips the jacobian comparison, for stochastic modules.
    pub fn no_jacobian(mut self) -> Self {
        self.check_jacobian = false;
        self
    }

    fn input(&self) -> Tensor {
        match &self.literal_input {
            Some(input) => input.clone(),
            None => spread_input(&self.input_shape, case_seed(self.name)),
        }
    }

    fn exercise(&self) {
        let module = (self.build)();
        let input = Variable::new(self.input());
        module.zero_grad();
        input.zero_grad();

        let output = module.forward(&input);
        let seed = Tensor::ones(output.data().raw_dim());
        output.backward(seed).unwrap();

        assert_eq!(input.grad().shape(), input.data().shape());
        for parameter in module.parameters() {
            assert_eq!(parameter.grad().shape(), parameter.data().shape());
        }

        if self.check_jacobian {
            let mut tracked = vec![input.clone()];
            tracked.extend(module.parameters());
            let forward = move || module.forward(&input);
            check_gradients(&forward, &tracked);
        }

        if let Some(build_in_place) = &self.build_in_place {
            let data = self.input();
            let plain_input = Variable::new(data.clone());
            let plain_output = (self.build)().forward(&plain_input);
            assert!(!plain_input.is_dirty());

            let in_place_input = Variable::new(data);
            let in_place_output = build_in_place().forward(&in_place_input);
            assert!(in_place_input.is_dirty());
            assert_eq!(*in_place_output.data(), *plain_output.data());
            assert_eq!(*in_place_input.data(), *plain_output.data());
        }
    }
}

/// Rejects duplicate case names, then exercises every case.
pub fn run_module_cases(cases: &[ModuleCase]) {
    let mut seen = HashSet::new();
    for case in cases {
        assert!(
            seen.insert(case.name),
            "Found two tests with the same name: {}",
            case.name
        );
    }

    for case in cases {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| case.exercise())) {
            panic!("case '{}' failed: {}", case.name, describe_panic(payload));
        }
    }
}

type CriterionBuilder = Box<dyn Fn() -> Box<dyn Criterion>>;

pub struct CriterionCase {
    name: &'static str,
    build: CriterionBuilder,
    input_shape: Vec<usize>,
    map_input: Option<fn(f32) -> f32>,
    map_target: Option<fn(f32) -> f32>,
}

impl CriterionCase {
    pub fn new<C, F>(name: &'static str, input_shape: &[usize], build: F) -> Self
    where
        C: Criterion + 'static,
        F: Fn() -> C + 'static,
    {
        Self {
            name,
            build: Box::new(move || Box::new(build())),
            input_shape: input_shape.to_vec(),
            map_input: None,
            map_target: None,
        }
    }

    pub fn map_input(mut self, map: fn(f32) -> f32) -> Self {
        self.map_input = Some(map);
        self
    }

    pub fn map_target(mut self, map: fn(f32) -> f32) -> Self {
        self.map_target = Some(map);
        self
    }

    fn exercise(&self) {
        let seed = case_seed(self.name);
        let mut input_data = spread_input(&self.input_shape, seed);
        if let Some(map) = self.map_input {
            input_data.map_inplace(|el| *el = map(*el));
        }
        // The half-scaled grid never intersects the full grid, which keeps
        // absolute-value kinks away from the perturbed inputs.
        let mut target_data = spread_input(&self.input_shape, seed ^ 0x9e3779b97f4a7c15);
        match self.map_target {
            Some(map) => target_data.map_inplace(|el| *el = map(*el)),
            None => target_data.map_inplace(|el| *el *= 0.5),
        }

        let criterion = (self.build)();
        let input = Variable::new(input_data);
        let target = Variable::detached(target_data);
        input.zero_grad();

        let loss = criterion.forward(&input, &target);
        assert_eq!(loss.data().shape(), [1]);

        loss.backward(Tensor::ones(IxDyn(&[1]))).unwrap();
        assert_eq!(input.grad().shape(), input.data().shape());
        assert!(!target.has_grad());

        let tracked = [input.clone()];
        let forward = move || criterion.forward(&input, &target);
        check_gradients(&forward, &tracked);
    }
}

pub fn run_criterion_cases(cases: &[CriterionCase]) {
    let mut seen = HashSet::new();
    for case in cases {
        assert!(
            seen.insert(case.name),
            "Found two tests with the same name: {}",
            case.name
        );
    }

    for case in cases {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| case.exercise())) {
            panic!("case '{}' failed: {}", case.name, describe_panic(payload));
        }
    }
}
