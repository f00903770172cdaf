//! # Internal Macros
//!
//! Accessor generation for zerocopy block headers.
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for struct fields stored as
//! little-endian wrapper types (U16, U64). Block headers are read in place
//! from block buffers, so every multi-byte field is an explicit-endianness
//! wrapper; this macro keeps the call sites looking like plain field access.
//!
//! ```ignore
//! impl NodeHeader {
//!     zerocopy_accessors! {
//!         entry_count: u16,
//!         recency: u64,
//!     }
//! }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
