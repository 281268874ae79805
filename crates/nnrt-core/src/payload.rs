use std::ops::Deref;
use std::sync::Arc;

use crate::device::{DeviceBuffer, DeviceContext};
use crate::Result;

/// Tensor data, resident either on the host or on the device.
///
/// Conversions are explicit: `to_host` is the only way to read device data
/// on the host, and `to_device` the only way to move host data across.
#[derive(Debug, Clone)]
pub enum Payload {
    Host(Vec<f32>),
    Device(DeviceBuffer),
}

impl Payload {
    /// Zero-filled host payload.
    pub fn zeros(len: usize) -> Self {
        Payload::Host(vec![0.0; len])
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Payload::Host(data) => data.len(),
            Payload::Device(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Payload::Device(_))
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Payload::Host(_))
    }

    /// Materialize on the host. Device payloads are downloaded.
    pub fn to_host(&self) -> Result<Vec<f32>> {
        match self {
            Payload::Host(data) => Ok(data.clone()),
            Payload::Device(buf) => buf.to_host(),
        }
    }

    /// Move onto `ctx`. Device payloads already owned by `ctx` are shared,
    /// not copied.
    pub fn to_device(&self, ctx: &DeviceContext) -> Result<Payload> {
        match self {
            Payload::Host(data) => Ok(Payload::Device(ctx.upload(data)?)),
            Payload::Device(buf) if buf.context_id() == ctx.id() => {
                ctx.ensure_live()?;
                Ok(Payload::Device(buf.clone()))
            }
            Payload::Device(buf) => Ok(Payload::Device(ctx.upload(&buf.to_host()?)?)),
        }
    }

    /// Read access for kernels. Host data is borrowed, device data is
    /// accessed in place without a transfer.
    pub fn view(&self) -> Result<PayloadView<'_>> {
        match self {
            Payload::Host(data) => Ok(PayloadView::Host(data)),
            Payload::Device(buf) => Ok(PayloadView::Device(buf.view()?)),
        }
    }
}

impl From<Vec<f32>> for Payload {
    fn from(data: Vec<f32>) -> Self {
        Payload::Host(data)
    }
}

/// Borrowed view over a payload's elements.
pub enum PayloadView<'a> {
    Host(&'a [f32]),
    Device(Arc<[f32]>),
}

impl Deref for PayloadView<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            PayloadView::Host(data) => data,
            PayloadView::Device(data) => data,
        }
    }
}
