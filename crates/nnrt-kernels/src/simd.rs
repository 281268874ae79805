//! Runtime SIMD capability detection, probed once per process.

use std::fmt;
use std::sync::OnceLock;

/// CPU features the host-side kernels can take advantage of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimdCapability {
    pub avx2: bool,
    pub fma: bool,
    pub neon: bool,
}

/// Inner-loop implementation selected for dense matmul.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatmulPath {
    Avx2Fma,
    Scalar,
}

impl fmt::Display for MatmulPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatmulPath::Avx2Fma => write!(f, "avx2+fma"),
            MatmulPath::Scalar => write!(f, "scalar"),
        }
    }
}

static DETECTED: OnceLock<SimdCapability> = OnceLock::new();

impl SimdCapability {
    pub fn detect() -> &'static SimdCapability {
        DETECTED.get_or_init(|| {
            #[cfg(target_arch = "x86_64")]
            {
                SimdCapability {
                    avx2: is_x86_feature_detected!("avx2"),
                    fma: is_x86_feature_detected!("fma"),
                    neon: false,
                }
            }

            #[cfg(target_arch = "aarch64")]
            {
                SimdCapability {
                    avx2: false,
                    fma: false,
                    neon: true,
                }
            }

            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                SimdCapability {
                    avx2: false,
                    fma: false,
                    neon: false,
                }
            }
        })
    }

    /// Matmul inner loop to use on this CPU. NEON has no dedicated path yet
    /// and falls back to the scalar loop, which LLVM auto-vectorizes.
    pub fn matmul_path(&self) -> MatmulPath {
        if self.avx2 && self.fma {
            MatmulPath::Avx2Fma
        } else {
            MatmulPath::Scalar
        }
    }

    /// Best available SIMD tier as a human-readable string.
    pub fn best_tier(&self) -> &'static str {
        if self.avx2 {
            "AVX2"
        } else if self.neon {
            "NEON"
        } else {
            "scalar"
        }
    }
}
