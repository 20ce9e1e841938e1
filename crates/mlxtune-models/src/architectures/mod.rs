//! Decoder-only transformer architectures.
//!
//! Both families share the attention stack; they differ in the feed-forward
//! block (dense SwiGLU vs. sparse mixture-of-experts). Every linear
//! projection is held as a [`Projection`](mlxtune_nn::Projection) slot so the
//! quantize / adapt / merge passes can rewrite the tree in place.

pub mod llama;
pub mod mixtral;

mod attention;

pub use attention::Attention;

use mlx_rs::error::Exception;
use mlxtune_nn::Projection;

/// Visitor over every projection slot in a module tree, invoked with the
/// slot's dotted path name.
pub type ProjectionVisitor<'a> =
    dyn FnMut(&str, &mut Projection) -> Result<(), Exception> + 'a;
