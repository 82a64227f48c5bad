use crate::catalog::{GateWeights, LstmModel, LstmWeights, CELL_STATE, HIDDEN_STATE};
use crate::{primary_parameter_names, AdamOptimizer, GATE_KEYS};
use dayson_core::{CoreError, Result, Tensor};
use dayson_engine::MathEngine;
use dayson_store::{SwapStore, TensorStore};
use log::{debug, error};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const LN_EPS: f32 = 1e-5;
const PROB_FLOOR: f64 = 1e-9;
const NORM_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepPhase {
    Forward,
    Backward,
    Update,
}

fn grad_of<'m>(grads: &'m BTreeMap<String, String>, name: &str) -> &'m str {
    grads
        .get(name)
        .expect("accumulator registered before use")
        .as_str()
}

/// Swap paths for the activations of one timestep.
struct StepActivations {
    input: PathBuf,
    fg: PathBuf,
    ig: PathBuf,
    og: PathBuf,
    cc: PathBuf,
    c_next: PathBuf,
    tanh_c: PathBuf,
    h_next: PathBuf,
    pred: PathBuf,
}

/// Everything the backward pass needs to find on disk, plus the mean
/// cross-entropy of the pass that produced it.
pub struct ForwardTrace {
    pub loss: f64,
    h_init: PathBuf,
    c_init: PathBuf,
    steps: Vec<StepActivations>,
}

impl ForwardTrace {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn h_prev_path(&self, t: usize) -> &Path {
        if t == 0 {
            &self.h_init
        } else {
            &self.steps[t - 1].h_next
        }
    }

    fn c_prev_path(&self, t: usize) -> &Path {
        if t == 0 {
            &self.c_init
        } else {
            &self.steps[t - 1].c_next
        }
    }
}

/// The LSTM training pipeline: a zero-RAM forward pass that streams every
/// activation to the swap store, BPTT that streams them back while
/// accumulating gradients on disk, global norm clipping, and the Adam
/// update. Model working set stays a handful of `[1,H]` rows regardless of
/// sequence length.
pub struct LstmCore<'a> {
    engine: &'a dyn MathEngine,
    tensors: &'a TensorStore,
    swaps: &'a SwapStore,
}

impl<'a> LstmCore<'a> {
    pub fn new(
        engine: &'a dyn MathEngine,
        tensors: &'a TensorStore,
        swaps: &'a SwapStore,
    ) -> Self {
        Self {
            engine,
            tensors,
            swaps,
        }
    }

    fn validate_sequence(&self, model: &LstmModel, inputs: &[i32], targets: &[i32]) -> Result<()> {
        if inputs.is_empty() || inputs.len() != targets.len() {
            return Err(CoreError::InvalidArgument(format!(
                "sequence of {} inputs against {} targets",
                inputs.len(),
                targets.len()
            )));
        }
        for &x in inputs {
            if x < 0 || x as usize >= model.config.vocab_size {
                return Err(CoreError::InvalidArgument(format!(
                    "input token {x} outside vocabulary of {}",
                    model.config.vocab_size
                )));
            }
        }
        for &y in targets {
            if y < 0 || y as usize >= model.config.output_size {
                return Err(CoreError::InvalidArgument(format!(
                    "target token {y} outside output range of {}",
                    model.config.output_size
                )));
            }
        }
        Ok(())
    }

    /// `sigmoid(LN(x.W_x + h_prev.W_h + b))`, or tanh for the candidate.
    fn activated_gate(
        &self,
        x: &Tensor,
        h_prev: &Tensor,
        gate: &GateWeights,
        hidden: usize,
        candidate: bool,
    ) -> Result<Tensor> {
        let mut pre = self.engine.create(&[1, hidden])?;
        self.engine.matmul(x, &gate.w_x, &mut pre)?;
        let mut hz = self.engine.create(&[1, hidden])?;
        self.engine.matmul(h_prev, &gate.w_h, &mut hz)?;
        self.engine.add_scaled(&mut pre, &hz, 1.0)?;
        drop(hz);
        self.engine.add_broadcast(&mut pre, &gate.b)?;
        self.engine
            .layer_norm(&mut pre, &gate.gamma, &gate.beta, LN_EPS)?;
        let mut out = self.engine.create(&[1, hidden])?;
        if candidate {
            self.engine.tanh(&pre, &mut out)?;
        } else {
            self.engine.sigmoid(&pre, &mut out)?;
        }
        Ok(out)
    }

    /// Streams the sequence through the recurrence. Each activation is
    /// swapped to disk the moment its last in-step use is done, so the
    /// resident set never grows with the sequence. The final hidden/cell
    /// state overwrites the carried state records.
    pub fn forward(
        &self,
        model: &LstmModel,
        weights: &LstmWeights,
        inputs: &[i32],
        targets: &[i32],
    ) -> Result<ForwardTrace> {
        self.validate_sequence(model, inputs, targets)?;
        let hidden = model.config.hidden_size;
        let embed = model.config.embedding_size;
        let out_size = model.config.output_size;

        let h0 = self.tensors.load(self.engine, model.id(HIDDEN_STATE)?)?;
        let c0 = self.tensors.load(self.engine, model.id(CELL_STATE)?)?;
        let h_init = self.swaps.swap_out(self.engine, h0, "h_init")?;
        let c_init = self.swaps.swap_out(self.engine, c0, "c_init")?;

        let mut steps: Vec<StepActivations> = Vec::with_capacity(inputs.len());
        let mut loss = 0.0f64;
        for (t, (&x_t, &y_t)) in inputs.iter().zip(targets).enumerate() {
            let h_prev = self.swaps.load(
                self.engine,
                if t == 0 { &h_init } else { &steps[t - 1].h_next },
            )?;
            let c_prev = self.swaps.load(
                self.engine,
                if t == 0 { &c_init } else { &steps[t - 1].c_next },
            )?;

            let mut x = self.engine.create(&[1, embed])?;
            self.engine.lookup(&weights.embedding, x_t as usize, &mut x)?;

            let fg = self.activated_gate(&x, &h_prev, &weights.gates[0], hidden, false)?;
            let ig = self.activated_gate(&x, &h_prev, &weights.gates[1], hidden, false)?;
            let cc = self.activated_gate(&x, &h_prev, &weights.gates[2], hidden, true)?;
            let og = self.activated_gate(&x, &h_prev, &weights.gates[3], hidden, false)?;
            drop(h_prev);
            let input = self.swaps.swap_out(self.engine, x, &format!("input_t{t}"))?;

            let mut c_next = self.engine.create(&[1, hidden])?;
            self.engine.mul(&fg, &c_prev, &mut c_next)?;
            let mut ic = self.engine.create(&[1, hidden])?;
            self.engine.mul(&ig, &cc, &mut ic)?;
            self.engine.add_scaled(&mut c_next, &ic, 1.0)?;
            drop(ic);
            drop(c_prev);
            let fg = self.swaps.swap_out(self.engine, fg, &format!("fg_t{t}"))?;
            let ig = self.swaps.swap_out(self.engine, ig, &format!("ig_t{t}"))?;
            let cc = self.swaps.swap_out(self.engine, cc, &format!("cc_t{t}"))?;

            let mut tanh_c = self.engine.create(&[1, hidden])?;
            self.engine.tanh(&c_next, &mut tanh_c)?;
            let c_next = self
                .swaps
                .swap_out(self.engine, c_next, &format!("c_next_t{t}"))?;

            let mut h_next = self.engine.create(&[1, hidden])?;
            self.engine.mul(&og, &tanh_c, &mut h_next)?;
            let og = self.swaps.swap_out(self.engine, og, &format!("og_t{t}"))?;
            let tanh_c = self
                .swaps
                .swap_out(self.engine, tanh_c, &format!("tanh_c_t{t}"))?;

            let mut logits = self.engine.create(&[1, out_size])?;
            self.engine.matmul(&h_next, &weights.w_hy, &mut logits)?;
            self.engine.add_broadcast(&mut logits, &weights.b_y)?;
            let mut pred = self.engine.create(&[1, out_size])?;
            self.engine.softmax(&logits, &mut pred)?;
            drop(logits);
            let h_next = self
                .swaps
                .swap_out(self.engine, h_next, &format!("h_next_t{t}"))?;

            let probs = self.engine.read_back(&pred)?;
            let p = (probs[y_t as usize] as f64).max(PROB_FLOOR);
            loss -= p.ln();
            let pred = self.swaps.swap_out(self.engine, pred, &format!("pred_t{t}"))?;

            steps.push(StepActivations {
                input,
                fg,
                ig,
                og,
                cc,
                c_next,
                tanh_c,
                h_next,
                pred,
            });
        }

        let last = steps.last().expect("sequence validated non-empty");
        let final_h = self.swaps.load(self.engine, &last.h_next)?;
        self.tensors
            .overwrite(self.engine, model.id(HIDDEN_STATE)?, &final_h)?;
        let final_c = self.swaps.load(self.engine, &last.c_next)?;
        self.tensors
            .overwrite(self.engine, model.id(CELL_STATE)?, &final_c)?;

        Ok(ForwardTrace {
            loss: loss / inputs.len() as f64,
            h_init,
            c_init,
            steps,
        })
    }

    fn rmw_grad(&self, id: &str, f: impl FnOnce(&mut Tensor) -> Result<()>) -> Result<()> {
        let mut g = self.tensors.load(self.engine, id)?;
        f(&mut g)?;
        self.tensors.overwrite(self.engine, id, &g)
    }

    /// `accumulator += delta`, streamed through the tensor store.
    fn accumulate(&self, grad_id: &str, delta: &Tensor) -> Result<()> {
        self.rmw_grad(grad_id, |g| self.engine.add_scaled(g, delta, 1.0))
    }

    /// BPTT over the swapped activations. Fills `grad_ids` (parameter name
    /// to accumulator id) as accumulators are created, so the caller can
    /// clean up partial state on failure. Ends with the per-element
    /// sanitize/clip and the global norm clip.
    pub fn backward(
        &self,
        model: &LstmModel,
        weights: &LstmWeights,
        trace: &ForwardTrace,
        inputs: &[i32],
        targets: &[i32],
        grad_ids: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        if trace.len() != inputs.len() || inputs.len() != targets.len() {
            return Err(CoreError::InvalidArgument(format!(
                "trace of {} steps against {} inputs",
                trace.len(),
                inputs.len()
            )));
        }
        let hidden = model.config.hidden_size;
        let embed = model.config.embedding_size;
        let out_size = model.config.output_size;

        for (name, shape) in model.primary_shapes() {
            let zeros = self.engine.create(&shape)?;
            let id = self
                .tensors
                .store(self.engine, &zeros, &format!("grad_{name}"))?;
            grad_ids.insert(name, id);
        }
        let mut dh_path = self
            .swaps
            .swap_out(self.engine, self.engine.create(&[1, hidden])?, "dh_next")?;
        let mut dc_path = self
            .swaps
            .swap_out(self.engine, self.engine.create(&[1, hidden])?, "dc_next")?;

        for t in (0..trace.len()).rev() {
            let step = &trace.steps[t];
            let pred = self.swaps.load(self.engine, &step.pred)?;
            let h_next = self.swaps.load(self.engine, &step.h_next)?;
            let tanh_c = self.swaps.load(self.engine, &step.tanh_c)?;
            let og = self.swaps.load(self.engine, &step.og)?;
            let cc = self.swaps.load(self.engine, &step.cc)?;
            let ig = self.swaps.load(self.engine, &step.ig)?;
            let fg = self.swaps.load(self.engine, &step.fg)?;
            let input = self.swaps.load(self.engine, &step.input)?;
            let h_prev = self.swaps.load(self.engine, trace.h_prev_path(t))?;
            let c_prev = self.swaps.load(self.engine, trace.c_prev_path(t))?;
            let dh_next = self.swaps.load(self.engine, &dh_path)?;
            let dc_next = self.swaps.load(self.engine, &dc_path)?;

            // d_pred = softmax - one_hot(y_t)
            let one = self.engine.one_hot(&[targets[t]], out_size)?;
            let mut d_pred = self.engine.create(&[1, out_size])?;
            self.engine.sub(&pred, &one, &mut d_pred)?;
            drop(one);
            drop(pred);

            let mut delta_why = self.engine.create(&[hidden, out_size])?;
            self.engine.matmul_at(&h_next, &d_pred, &mut delta_why)?;
            self.accumulate(grad_of(grad_ids, "w_hy"), &delta_why)?;
            drop(delta_why);
            self.accumulate(grad_of(grad_ids, "b_y"), &d_pred)?;
            drop(h_next);

            // dh = d_pred.W_hy^T + dh_next
            let mut dh = self.engine.create(&[1, hidden])?;
            self.engine.matmul_bt(&d_pred, &weights.w_hy, &mut dh)?;
            self.engine.add_scaled(&mut dh, &dh_next, 1.0)?;
            drop(dh_next);
            drop(d_pred);

            // dc = dc_next + (dh . o) . (1 - tanh_c^2)
            let mut deriv = self.engine.create(&[1, hidden])?;
            self.engine.tanh_deriv(&tanh_c, &mut deriv)?;
            let mut tmp = self.engine.create(&[1, hidden])?;
            self.engine.mul(&dh, &og, &mut tmp)?;
            let mut dc = self.engine.create(&[1, hidden])?;
            self.engine.mul(&tmp, &deriv, &mut dc)?;
            self.engine.add_scaled(&mut dc, &dc_next, 1.0)?;
            drop(dc_next);

            // d_o = dh . tanh_c . sigmoid'(o)
            self.engine.sigmoid_deriv(&og, &mut deriv)?;
            self.engine.mul(&dh, &tanh_c, &mut tmp)?;
            let mut d_o = self.engine.create(&[1, hidden])?;
            self.engine.mul(&tmp, &deriv, &mut d_o)?;
            drop(tanh_c);
            drop(dh);

            // d_cc = dc . i . (1 - cc^2)
            self.engine.tanh_deriv(&cc, &mut deriv)?;
            self.engine.mul(&dc, &ig, &mut tmp)?;
            let mut d_cc = self.engine.create(&[1, hidden])?;
            self.engine.mul(&tmp, &deriv, &mut d_cc)?;

            // d_i = dc . cc . sigmoid'(i)
            self.engine.sigmoid_deriv(&ig, &mut deriv)?;
            self.engine.mul(&dc, &cc, &mut tmp)?;
            let mut d_i = self.engine.create(&[1, hidden])?;
            self.engine.mul(&tmp, &deriv, &mut d_i)?;
            drop(cc);
            drop(ig);

            // d_f = dc . c_prev . sigmoid'(f)
            self.engine.sigmoid_deriv(&fg, &mut deriv)?;
            self.engine.mul(&dc, &c_prev, &mut tmp)?;
            let mut d_f = self.engine.create(&[1, hidden])?;
            self.engine.mul(&tmp, &deriv, &mut d_f)?;
            drop(c_prev);
            drop(og);

            // dc_prev = dc . f
            let mut dc_prev = self.engine.create(&[1, hidden])?;
            self.engine.mul(&dc, &fg, &mut dc_prev)?;
            drop(fg);
            drop(dc);
            drop(deriv);

            let mut dh_prev = self.engine.create(&[1, hidden])?;
            let mut d_input = self.engine.create(&[1, embed])?;
            let mut tmp_e = self.engine.create(&[1, embed])?;
            let deltas = [&d_f, &d_i, &d_cc, &d_o];
            for (gi, d_g) in deltas.into_iter().enumerate() {
                let key = GATE_KEYS[gi];
                let gate = &weights.gates[gi];

                let mut delta_wh = self.engine.create(&[hidden, hidden])?;
                self.engine.matmul_at(&h_prev, d_g, &mut delta_wh)?;
                self.accumulate(grad_of(grad_ids, &format!("w_h_{key}")), &delta_wh)?;
                drop(delta_wh);

                let mut delta_wx = self.engine.create(&[embed, hidden])?;
                self.engine.matmul_at(&input, d_g, &mut delta_wx)?;
                self.accumulate(grad_of(grad_ids, &format!("w_x_{key}")), &delta_wx)?;
                drop(delta_wx);

                self.accumulate(grad_of(grad_ids, &format!("b_{key}")), d_g)?;

                self.engine.matmul_bt(d_g, &gate.w_h, &mut tmp)?;
                self.engine.add_scaled(&mut dh_prev, &tmp, 1.0)?;
                self.engine.matmul_bt(d_g, &gate.w_x, &mut tmp_e)?;
                self.engine.add_scaled(&mut d_input, &tmp_e, 1.0)?;
            }
            drop(tmp);
            drop(tmp_e);
            drop(h_prev);
            drop(input);

            self.rmw_grad(grad_of(grad_ids, "embedding"), |g| {
                self.engine
                    .accumulate_gradient(g, &d_input, inputs[t] as usize)
            })?;
            drop(d_input);

            let new_dh = self.swaps.swap_out(self.engine, dh_prev, "dh_next")?;
            let new_dc = self.swaps.swap_out(self.engine, dc_prev, "dc_next")?;
            self.swaps.delete(&dh_path)?;
            self.swaps.delete(&dc_path)?;
            dh_path = new_dh;
            dc_path = new_dc;
        }
        self.swaps.delete(&dh_path)?;
        self.swaps.delete(&dc_path)?;

        // per-element sanitize/clip, then the global norm clip
        for id in grad_ids.values() {
            self.rmw_grad(id, |g| {
                self.engine
                    .sanitize_and_clip(g, model.config.grad_element_clip)
            })?;
        }
        let mut total = 0.0f64;
        for id in grad_ids.values() {
            let g = self.tensors.load(self.engine, id)?;
            total += self.engine.sum_of_squares(&g)?;
        }
        let norm = total.sqrt();
        let max_norm = model.config.grad_max_norm as f64;
        if norm > max_norm {
            let factor = (max_norm / (norm + NORM_EPS)) as f32;
            debug!("gradient norm {norm:.4} clipped by {factor:.6}");
            for id in grad_ids.values() {
                self.rmw_grad(id, |g| self.engine.scale(g, factor))?;
            }
        }
        Ok(())
    }

    /// One full training step: forward, BPTT, Adam. Swap files and gradient
    /// accumulators are removed on every exit path; a fault in any phase
    /// still runs the cleanup before the error is re-raised.
    pub fn train_sequence(
        &self,
        model: &LstmModel,
        weights: &mut LstmWeights,
        adam: &mut AdamOptimizer,
        inputs: &[i32],
        targets: &[i32],
        lr: f32,
    ) -> Result<f64> {
        let mut grad_ids = BTreeMap::new();
        let mut phase = StepPhase::Forward;
        let outcome: Result<f64> = (|| {
            let trace = self.forward(model, weights, inputs, targets)?;
            phase = StepPhase::Backward;
            self.backward(model, weights, &trace, inputs, targets, &mut grad_ids)?;
            phase = StepPhase::Update;
            for name in primary_parameter_names() {
                let grad_id = grad_ids
                    .get(&name)
                    .ok_or_else(|| CoreError::NotFound(format!("gradient for {name}")))?
                    .clone();
                let param_id = model.id(&name)?.to_string();
                let param = weights.param_mut(&name)?;
                adam.update(self.engine, self.tensors, &param_id, param, &grad_id, lr)?;
            }
            Ok(trace.loss)
        })();
        if let Err(e) = &outcome {
            error!("training step failed during {phase:?}: {e}");
        }
        self.cleanup(&grad_ids);
        outcome
    }

    /// Forward-only scoring for validation. Swap files are created and
    /// removed exactly as in training.
    pub fn evaluate_sequence(
        &self,
        model: &LstmModel,
        weights: &LstmWeights,
        inputs: &[i32],
        targets: &[i32],
    ) -> Result<f64> {
        let outcome = self
            .forward(model, weights, inputs, targets)
            .map(|trace| trace.loss);
        self.cleanup(&BTreeMap::new());
        outcome
    }

    /// One forward+backward+update cycle on synthetic input, verifying that
    /// the pipeline produces a sane loss and live, finite gradients. Run on
    /// a scratch model before real training; failure aborts training.
    pub fn sanity_check(
        &self,
        model: &LstmModel,
        weights: &mut LstmWeights,
        adam: &mut AdamOptimizer,
    ) -> Result<()> {
        let vocab = model.config.vocab_size as i32;
        let out_size = model.config.output_size as i32;
        let inputs: Vec<i32> = (0..4).map(|t| t % vocab).collect();
        let targets: Vec<i32> = (1..5).map(|t| t % out_size).collect();

        let mut grad_ids = BTreeMap::new();
        let outcome: Result<()> = (|| {
            let trace = self.forward(model, weights, &inputs, &targets)?;
            let baseline = (model.config.output_size as f64).ln();
            if !trace.loss.is_finite() || (trace.loss - baseline).abs() >= baseline {
                return Err(CoreError::SanityFailed(format!(
                    "first-pass loss {:.4} outside one magnitude of ln(V) = {baseline:.4}",
                    trace.loss
                )));
            }
            self.backward(model, weights, &trace, &inputs, &targets, &mut grad_ids)?;
            let mut mass = 0.0f64;
            for (name, id) in &grad_ids {
                let g = self.tensors.load(self.engine, id)?;
                let data = self.engine.read_back(&g)?;
                if data.iter().any(|v| !v.is_finite()) {
                    return Err(CoreError::SanityFailed(format!(
                        "gradient {name} contains a non-finite value"
                    )));
                }
                mass += data.iter().map(|v| v.abs() as f64).sum::<f64>();
            }
            if mass <= 1e-9 {
                return Err(CoreError::SanityFailed(format!(
                    "total gradient mass {mass:e} is vanishing"
                )));
            }
            for name in primary_parameter_names() {
                let grad_id = grad_ids
                    .get(&name)
                    .ok_or_else(|| CoreError::NotFound(format!("gradient for {name}")))?
                    .clone();
                let param_id = model.id(&name)?.to_string();
                let param = weights.param_mut(&name)?;
                adam.update(self.engine, self.tensors, &param_id, param, &grad_id, 1e-3)?;
            }
            Ok(())
        })();
        self.cleanup(&grad_ids);
        outcome
    }

    /// Deletes the step's swap files and gradient accumulators. Never
    /// raises: partial release beats a resource leak.
    fn cleanup(&self, grad_ids: &BTreeMap<String, String>) {
        self.swaps.clear_all();
        for id in grad_ids.values() {
            self.tensors.delete(id);
        }
        debug!("step cleanup complete ({} accumulators)", grad_ids.len());
    }
}
