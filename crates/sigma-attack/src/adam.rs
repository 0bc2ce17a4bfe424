//! Adam optimizer state for the perturbation variable.

use ndarray::{Array4, Zip};

/// Adam optimizer hyperparameters.
///
/// Defaults match TensorFlow/PyTorch: β₁=0.9, β₂=0.999, ε=1e-8.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    /// Learning rate (step size)
    pub learning_rate: f32,
    /// Exponential decay rate for first moment (β₁)
    pub beta1: f32,
    /// Exponential decay rate for second moment (β₂)
    pub beta2: f32,
    /// Small constant for numerical stability (ε)
    pub epsilon: f32,
}

impl AdamParams {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Moment estimates for one parameter tensor.
#[derive(Debug, Clone)]
pub struct AdamState {
    m: Array4<f32>,
    v: Array4<f32>,
    t: usize,
}

impl AdamState {
    pub fn new(dim: (usize, usize, usize, usize)) -> Self {
        Self {
            m: Array4::zeros(dim),
            v: Array4::zeros(dim),
            t: 0,
        }
    }

    /// Forget all moments, as if freshly constructed.
    pub fn reset(&mut self) {
        self.m.fill(0.0);
        self.v.fill(0.0);
        self.t = 0;
    }

    /// Number of updates applied since the last reset.
    pub fn steps(&self) -> usize {
        self.t
    }

    /// One descent step on `param`.
    ///
    /// - m = β₁ * m + (1 - β₁) * grad
    /// - v = β₂ * v + (1 - β₂) * grad²
    /// - m_hat = m / (1 - β₁^t), v_hat = v / (1 - β₂^t)
    /// - param = param - lr * m_hat / (√v_hat + ε)
    pub fn update(&mut self, param: &mut Array4<f32>, grad: &Array4<f32>, params: &AdamParams) {
        self.t += 1;
        let t = self.t as i32;
        let bias_correction1 = 1.0 - params.beta1.powi(t);
        let bias_correction2 = 1.0 - params.beta2.powi(t);

        Zip::from(param)
            .and(&mut self.m)
            .and(&mut self.v)
            .and(grad)
            .for_each(|p, m, v, &g| {
                *m = params.beta1 * *m + (1.0 - params.beta1) * g;
                *v = params.beta2 * *v + (1.0 - params.beta2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= params.learning_rate * m_hat / (v_hat.sqrt() + params.epsilon);
            });
    }
}
