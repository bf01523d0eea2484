// This macro generates index newtypes: a u32 wrapped so that indices into different arenas
// (terms, rules, states, ...) cannot be accidentally mixed up.

/// Generate a struct `$n` wrapping a `u32` index, with lossless conversions to/from `usize`.
///
/// It is guaranteed that values of the generated type convert, without loss of precision, to
/// `usize` with `usize::from(x)`. `usize` values convert with `$n::from(y_usize)`, panicking if
/// that would lose precision.
#[macro_export]
macro_rules! idx_newtype {
    ($(#[$attr:meta])* $n: ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $n(pub u32);

        impl From<$n> for usize {
            fn from(i: $n) -> usize {
                num_traits::cast(i.0).unwrap()
            }
        }

        impl From<$n> for u32 {
            fn from(i: $n) -> u32 {
                i.0
            }
        }

        impl From<usize> for $n {
            fn from(i: usize) -> $n {
                $n(num_traits::cast(i).unwrap())
            }
        }

        impl $n {
            pub fn as_u32(self) -> u32 {
                self.0
            }
        }
    };
}

idx_newtype!(
    /// An index into the term arena of a [crate::TermSet].
    TermIdx
);
idx_newtype!(
    /// An index into a normalized grammar's rule list.
    RuleIdx
);
idx_newtype!(
    /// An index into a normalized grammar's skip-scope list. Scope 0 is the global scope.
    SkipIdx
);
