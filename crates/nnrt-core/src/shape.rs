use std::fmt;

use smallvec::SmallVec;

type Dims = SmallVec<[usize; 4]>;

/// Row-major tensor dimensions.
///
/// Up to four dimensions live inline: `[B, C, H, W]` image tensors are the
/// common case.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Dims,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self { dims: dims.into() }
    }

    /// Dimensions as written in a graph description. Negative entries are
    /// the batch placeholder and become 1; `None` if any dimension is zero.
    pub fn from_declared(dims: &[i64]) -> Option<Self> {
        let dims = dims
            .iter()
            .map(|&d| match d {
                0 => None,
                d => Some(usize::try_from(d).unwrap_or(1)),
            })
            .collect::<Option<Dims>>()?;
        Some(Self { dims })
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Element count; 1 for a rank-0 shape.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Map an end-relative axis (`-1` = last) onto `0..ndim`.
    pub fn resolve_axis(&self, axis: i64) -> Option<usize> {
        let ndim = i64::try_from(self.ndim()).ok()?;
        let resolved = if axis < 0 { ndim + axis } else { axis };
        (0..ndim).contains(&resolved).then_some(resolved as usize)
    }

    /// Product of the dimensions before `axis`.
    pub fn outer_size(&self, axis: usize) -> usize {
        self.dims.iter().take(axis).product()
    }

    /// Product of the dimensions after `axis`.
    pub fn inner_size(&self, axis: usize) -> usize {
        self.dims.iter().skip(axis + 1).product()
    }

    /// Element strides of a packed row-major buffer with this shape.
    pub fn contiguous_strides(&self) -> Dims {
        let mut strides: Dims = SmallVec::from_elem(1, self.ndim());
        let mut acc = 1;
        for (stride, &d) in strides.iter_mut().zip(&self.dims).rev() {
            *stride = acc;
            acc *= d;
        }
        strides
    }

    /// Target shape of a size-preserving reshape. One entry may be `-1` and
    /// absorbs whatever the others leave; `None` if the sizes cannot agree.
    pub fn resolve_reshape(&self, target: &[i64]) -> Option<Shape> {
        let mut free = None;
        let mut dims = Dims::with_capacity(target.len());
        for (i, &d) in target.iter().enumerate() {
            match d {
                -1 if free.is_none() => {
                    free = Some(i);
                    dims.push(1);
                }
                d if d > 0 => dims.push(usize::try_from(d).ok()?),
                _ => return None,
            }
        }

        let fixed = dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))?;
        let numel = self.numel();
        if let Some(i) = free {
            if fixed == 0 || numel % fixed != 0 {
                return None;
            }
            dims[i] = numel / fixed;
        } else if fixed != numel {
            return None;
        }
        Some(Shape { dims })
    }

    /// The shape with one axis dropped.
    pub fn without_axis(&self, axis: usize) -> Shape {
        Shape {
            dims: self
                .dims
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != axis)
                .map(|(_, &d)| d)
                .collect(),
        }
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.dims.to_vec()
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shape").field(&self.dims.as_slice()).finish()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims.as_slice())
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape { dims: dims.into() }
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(&dims)
    }
}
