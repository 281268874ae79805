//! Non-maximum suppression over 2-D detections. Runs on the host.

use nnrt_core::{NnrtError, Payload, Result, Shape};
use nnrt_kernels::Compiler;
use serde::Deserialize;

use crate::operator::{check_inputs, not_setup, Op};

/// Added to box extents so zero-size boxes keep a non-zero area.
const EPS: f32 = 1e-4;

/// Length of the per-row header `(cx, cy, w, h, score)`.
const HEADER: usize = 5;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct NmsDetection2dParam {
    /// Score threshold: candidates scoring below it are discarded.
    pub thresh: f32,
    /// IoU threshold: overlaps above it suppress the lower-scoring box.
    pub nms: f32,
    pub nms_per_class: bool,
}

impl Default for NmsDetection2dParam {
    fn default() -> Self {
        Self {
            thresh: 0.5,
            nms: 0.45,
            nms_per_class: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Corners {
    x_min: f32,
    y_min: f32,
    x_max: f32,
    y_max: f32,
}

impl Corners {
    fn from_row(row: &[f32]) -> Self {
        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        Self {
            x_min: cx - w / 2.0,
            y_min: cy - h / 2.0,
            x_max: cx + w / 2.0,
            y_max: cy + h / 2.0,
        }
    }

    fn area(&self) -> f32 {
        (self.x_max - self.x_min + EPS) * (self.y_max - self.y_min + EPS)
    }

    fn iou(&self, other: &Corners) -> f32 {
        let w = (self.x_max.min(other.x_max) - self.x_min.max(other.x_min) + EPS).max(0.0);
        let h = (self.y_max.min(other.y_max) - self.y_min.max(other.y_min) + EPS).max(0.0);
        let intersection = w * h;
        intersection / (self.area() + other.area() - intersection)
    }
}

/// Greedy suppression. Returns the indices that survive, given per-box
/// scores and corners.
fn greedy(scores: &[f32], boxes: &[Corners], thresh: f32, nms: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).filter(|&j| scores[j] >= thresh).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut kept: Vec<usize> = Vec::new();
    for j in order {
        if kept.iter().all(|&k| boxes[k].iou(&boxes[j]) <= nms) {
            kept.push(j);
        }
    }
    kept
}

/// `NmsDetection2d` over `[B, N, 5 + C]` rows `(cx, cy, w, h, score, p₁..p_C)`.
///
/// The output has the input's shape. Every header is copied; class
/// probabilities survive only where the box was kept, either once per box by
/// raw score or independently per class by `score · p_c`.
#[derive(Debug)]
pub struct NmsDetection2d {
    param: NmsDetection2dParam,
    dims: Option<[usize; 3]>,
}

impl NmsDetection2d {
    pub fn new(param: NmsDetection2dParam) -> Self {
        Self { param, dims: None }
    }

    fn dims(x: &Shape) -> Result<[usize; 3]> {
        match x.dims() {
            &[b, n, row] if row >= HEADER => Ok([b, n, row - HEADER]),
            _ => Err(NnrtError::Unsupported(format!(
                "NmsDetection2d expects [B, N, 5 + C], got {x}"
            ))),
        }
    }

    fn suppress(&self, x: &[f32], [batch, n, classes]: [usize; 3]) -> Vec<f32> {
        let row = HEADER + classes;
        let NmsDetection2dParam {
            thresh,
            nms,
            nms_per_class,
        } = self.param;
        let mut y = vec![0.0f32; x.len()];

        for b in 0..batch {
            let rows = &x[b * n * row..(b + 1) * n * row];
            let out = &mut y[b * n * row..(b + 1) * n * row];
            let boxes: Vec<Corners> = rows.chunks_exact(row).map(Corners::from_row).collect();
            for (dst, src) in out.chunks_exact_mut(row).zip(rows.chunks_exact(row)) {
                dst[..HEADER].copy_from_slice(&src[..HEADER]);
            }

            if nms_per_class {
                for c in 0..classes {
                    let scores: Vec<f32> = rows
                        .chunks_exact(row)
                        .map(|r| r[4] * r[HEADER + c])
                        .collect();
                    for j in greedy(&scores, &boxes, thresh, nms) {
                        out[j * row + HEADER + c] = rows[j * row + HEADER + c];
                    }
                }
            } else {
                let scores: Vec<f32> = rows.chunks_exact(row).map(|r| r[4]).collect();
                for j in greedy(&scores, &boxes, thresh, nms) {
                    let span = j * row + HEADER..(j + 1) * row;
                    out[span.clone()].copy_from_slice(&rows[span]);
                }
            }
        }
        y
    }
}

impl Op for NmsDetection2d {
    fn kind(&self) -> &'static str {
        "NmsDetection2d"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 1, 1)?;
        Self::dims(&inputs[0])?;
        Ok(vec![inputs[0].clone()])
    }

    fn setup(&mut self, _compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        self.dims = Some(Self::dims(&inputs[0])?);
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let dims = self.dims.ok_or_else(|| not_setup(self.kind()))?;
        let x = inputs[0].to_host()?;
        let expected: usize = dims[0] * dims[1] * (HEADER + dims[2]);
        if x.len() != expected {
            return Err(NnrtError::size_mismatch("NmsDetection2d input", &[expected], x.len()));
        }
        tracing::trace!(batch = dims[0], boxes = dims[1], classes = dims[2], "nms on host");
        Ok(vec![Payload::Host(self.suppress(&x, dims))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt_core::DeviceContext;

    fn run(param: NmsDetection2dParam, shape: [usize; 3], x: Vec<f32>) -> Vec<f32> {
        let compiler = Compiler::new(DeviceContext::new(), true);
        let mut op = NmsDetection2d::new(param);
        let shape = Shape::from(shape);
        let outputs = op.output_shapes(&[shape.clone()]).unwrap();
        op.setup(&compiler, &[shape], &outputs).unwrap();
        let x = Payload::Device(compiler.context().upload(&x).unwrap());
        op.forward(&[&x]).unwrap()[0].to_host().unwrap()
    }

    #[test]
    fn test_iou() {
        let a = Corners::from_row(&[0.5, 0.5, 1.0, 1.0]);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        let far = Corners::from_row(&[5.0, 5.0, 1.0, 1.0]);
        assert_eq!(a.iou(&far), 0.0);
        // half overlap: intersection 0.5, union 1.5
        let half = Corners::from_row(&[1.0, 0.5, 1.0, 1.0]);
        assert!((a.iou(&half) - 1.0 / 3.0).abs() < 1e-3);
    }

    #[test]
    fn test_shared_score_mode() {
        let param = NmsDetection2dParam {
            thresh: 0.3,
            nms: 0.3,
            nms_per_class: false,
        };
        #[rustfmt::skip]
        let x = vec![
            0.5, 0.5, 1.0, 1.0, 0.6, 0.7, 0.3, // overlaps the next box, lower score
            0.55, 0.5, 1.0, 1.0, 0.9, 0.2, 0.8,
            3.0, 3.0, 1.0, 1.0, 0.2, 0.5, 0.5, // below the score threshold
        ];
        let y = run(param, [1, 3, 7], x.clone());
        // headers always copied
        for j in 0..3 {
            assert_eq!(&y[j * 7..j * 7 + 5], &x[j * 7..j * 7 + 5]);
        }
        assert_eq!(&y[5..7], &[0.0, 0.0]);
        assert_eq!(&y[12..14], &[0.2, 0.8]);
        assert_eq!(&y[19..21], &[0.0, 0.0]);
    }

    #[test]
    fn test_per_class_mode() {
        let param = NmsDetection2dParam {
            thresh: 0.3,
            nms: 0.3,
            nms_per_class: true,
        };
        #[rustfmt::skip]
        let x = vec![
            0.5, 0.5, 1.0, 1.0, 1.0, 0.9, 0.1,
            0.55, 0.5, 1.0, 1.0, 1.0, 0.4, 0.8,
        ];
        let y = run(param, [1, 2, 7], x);
        // class 0: box 0 (0.9) suppresses box 1 (0.4)
        assert_eq!(y[5], 0.9);
        assert_eq!(y[12], 0.0);
        // class 1: box 1 (0.8) wins, box 0 (0.1) is under the score threshold
        assert_eq!(y[6], 0.0);
        assert_eq!(y[13], 0.8);
    }

    #[test]
    fn test_non_overlapping_boxes_all_survive() {
        let param = NmsDetection2dParam {
            thresh: 0.3,
            nms: 0.3,
            nms_per_class: false,
        };
        let x = vec![0.0, 0.0, 1.0, 1.0, 0.9, 1.0, 5.0, 5.0, 1.0, 1.0, 0.8, 1.0];
        let y = run(param, [1, 2, 6], x.clone());
        assert_eq!(y, x);
    }

    #[test]
    fn test_rejects_short_rows() {
        let op = NmsDetection2d::new(NmsDetection2dParam::default());
        assert!(op.output_shapes(&[Shape::new(&[1, 2, 4])]).is_err());
    }
}
