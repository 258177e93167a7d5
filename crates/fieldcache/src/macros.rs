/// Declares a field tag enum and implements [`FieldTag`](crate::field::FieldTag) for it.
///
/// Variants are numbered in declaration order. Their names are used as keys in snapshot
/// files, so renaming a variant invalidates persisted values of that field.
///
/// ```
/// fieldcache::field_tags! {
///     pub enum ShowField {
///         Title,
///         Score,
///     }
/// }
///
/// use fieldcache::FieldTag;
/// assert_eq!(ShowField::Score.index(), 1);
/// assert_eq!(ShowField::from_name("Title"), Some(ShowField::Title));
/// ```
#[macro_export]
macro_rules! field_tags {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $crate::field::FieldTag for $name {
            const ALL: &'static [Self] = &[$(Self::$variant),+];

            fn index(self) -> usize {
                self as usize
            }

            fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant)),+
                }
            }
        }

        const _: () = assert!(
            <$name as $crate::field::FieldTag>::ALL.len() <= 64,
            "a field tag enum supports at most 64 variants",
        );
    };
}
