//! NDR encoding/decoding context
//!
//! The context carries the negotiated data representation (byte order) and
//! the limits the decoder enforces on attacker-controlled sizes.

/// Default cap on elements in a single decoded array
pub const DEFAULT_MAX_ARRAY_ELEMENTS: usize = 16 * 1024 * 1024;

/// Default cap on bytes a single decoded array may occupy
pub const DEFAULT_MAX_ALLOCATION: usize = 64 * 1024 * 1024;

/// Default cap on how many pointers deep a decoded referent may sit
pub const DEFAULT_MAX_POINTER_DEPTH: usize = 256;

/// NDR encoding/decoding context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdrContext {
    /// Whether to use little-endian byte order
    pub little_endian: bool,
    /// Maximum element count accepted for one array
    pub max_array_elements: usize,
    /// Maximum number of bytes accepted for one array
    pub max_allocation: usize,
    /// Maximum nesting of deferred referents (a pointer inside a referent
    /// inside a referent ...). Bounds the recursion that resolves them.
    pub max_pointer_depth: usize,
}

impl NdrContext {
    /// Create a new NDR context with little-endian byte order (default)
    pub fn new() -> Self {
        Self {
            little_endian: true,
            max_array_elements: DEFAULT_MAX_ARRAY_ELEMENTS,
            max_allocation: DEFAULT_MAX_ALLOCATION,
            max_pointer_depth: DEFAULT_MAX_POINTER_DEPTH,
        }
    }

    /// Create a context with big-endian byte order
    pub fn big_endian() -> Self {
        Self::with_byte_order(false)
    }

    /// Create a context with specified byte order
    pub fn with_byte_order(little_endian: bool) -> Self {
        Self {
            little_endian,
            ..Self::new()
        }
    }

    /// Same limits, different byte order
    pub fn byte_order(self, little_endian: bool) -> Self {
        Self {
            little_endian,
            ..self
        }
    }

    pub fn max_array_elements(mut self, max: usize) -> Self {
        self.max_array_elements = max;
        self
    }

    pub fn max_allocation(mut self, max: usize) -> Self {
        self.max_allocation = max;
        self
    }

    pub fn max_pointer_depth(mut self, max: usize) -> Self {
        self.max_pointer_depth = max;
        self
    }

    /// Calculate padding needed to align to the given boundary
    #[inline]
    pub fn align_padding(position: usize, alignment: usize) -> usize {
        if alignment <= 1 {
            return 0;
        }
        let remainder = position % alignment;
        if remainder == 0 {
            0
        } else {
            alignment - remainder
        }
    }

    /// Whether `alignment` is one of the NDR primitive widths
    #[inline]
    pub fn is_valid_alignment(alignment: usize) -> bool {
        matches!(alignment, 1 | 2 | 4 | 8)
    }
}

impl Default for NdrContext {
    fn default() -> Self {
        Self::new()
    }
}
