/// The block sizes negotiable under RFC 7959, plus BERT (RFC 8323).
///
/// BERT blocks are carried in 1024-byte units but a single message may
/// hold several units, so [`BlockSize::len`] alone does not bound a
/// BERT message; see
/// [`crate::csm::Capabilities::max_outbound_payload_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockSize {
  /// 16 bytes
  S16,
  /// 32 bytes
  S32,
  /// 64 bytes
  S64,
  /// 128 bytes
  S128,
  /// 256 bytes
  S256,
  /// 512 bytes
  S512,
  /// 1024 bytes
  S1024,
  /// BERT; 1024-byte units, possibly many per message
  Bert,
}

impl BlockSize {
  /// Every non-BERT size, smallest first.
  pub const STANDARD: [BlockSize; 7] = [BlockSize::S16,
                                        BlockSize::S32,
                                        BlockSize::S64,
                                        BlockSize::S128,
                                        BlockSize::S256,
                                        BlockSize::S512,
                                        BlockSize::S1024];

  /// The size of one block (one unit, for BERT) in bytes
  pub const fn len(&self) -> usize {
    match self {
      | BlockSize::S16 => 16,
      | BlockSize::S32 => 32,
      | BlockSize::S64 => 64,
      | BlockSize::S128 => 128,
      | BlockSize::S256 => 256,
      | BlockSize::S512 => 512,
      | BlockSize::S1024 | BlockSize::Bert => 1024,
    }
  }

  /// Is this BERT?
  pub const fn is_bert(&self) -> bool {
    matches!(self, BlockSize::Bert)
  }

  /// The largest standard size whose blocks fit in `max_payload` bytes.
  ///
  /// `None` when even 16-byte blocks do not fit.
  pub fn fit(max_payload: usize) -> Option<BlockSize> {
    Self::STANDARD.iter()
                  .rev()
                  .find(|size| size.len() <= max_payload)
                  .copied()
  }

  /// The next size down, for shrinking after a 4.13.
  pub fn halved(&self) -> Option<BlockSize> {
    let all = Self::STANDARD;
    match self {
      | BlockSize::Bert => Some(BlockSize::S1024),
      | other => all.iter()
                    .position(|size| size == other)
                    .and_then(|ix| ix.checked_sub(1))
                    .map(|ix| all[ix]),
    }
  }
}

/// A decoded Block1 / Block2 option value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
  /// Relative number of this block within the transfer
  pub num: u32,
  /// Negotiated block size
  pub size: BlockSize,
  /// Whether more blocks follow this one
  pub more: bool,
}

impl Block {
  /// Shorthand constructor
  pub fn new(num: u32, size: BlockSize, more: bool) -> Self {
    Self { num, size, more }
  }

  /// Byte offset of the start of this block within the full entity
  pub fn offset(&self) -> usize {
    self.num as usize * self.size.len()
  }
}

/// The option set the engine cares about, already decoded.
///
/// The wire codec lives outside this crate; options it does not
/// recognize never reach us.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Opts {
  /// Uri-Path, joined with `/`
  pub uri_path: String,
  /// Observe (RFC 7641): 0 registers, 1 deregisters, anything else is
  /// a notification sequence number
  pub observe: Option<u32>,
  /// ETag of the representation
  pub etag: Option<Vec<u8>>,
  /// Block1: descriptive of the request payload
  pub block1: Option<Block>,
  /// Block2: descriptive of the response payload
  pub block2: Option<Block>,
  /// Size1: total request entity size in bytes
  pub size1: Option<u32>,
  /// Size2: total response entity size in bytes
  pub size2: Option<u32>,
  /// Max-Message-Size carried by a 7.01 CSM
  pub csm_max_message_size: Option<u32>,
  /// Block-Wise-Transfer carried by a 7.01 CSM
  pub csm_block_transfer: bool,
}
