//! Derive macro for error types.
//!
//! Generates `std::fmt::Display` and `std::error::Error` implementations,
//! replacing the `thiserror` crate. Each enum variant (or the struct
//! itself) carries an `#[error("...")]` attribute whose string is a
//! `format!`-style template:
//!
//! ```ignore
//! #[derive(Debug, Error)]
//! pub enum StoreError {
//!     #[error("storage backend failure: {0}")]
//!     Backend(String),
//!
//!     #[error("nonce mismatch: expected {expected}, got {actual}")]
//!     NonceMismatch { expected: u32, actual: u32 },
//! }
//! ```
//!
//! Placeholders name the fields they print: `{0}`, `{1}` (or bare `{}`) by
//! position, `{name}` for named fields. Format specs pass through, so
//! `{0:#010x}` renders the first field in hex. The template is scanned at
//! expansion time: unknown fields are compile errors, and fields the
//! message never mentions are left unbound rather than tripping format
//! checks.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Ident, LitStr, Member, parse_macro_input};

/// Derives `Display` and `Error` for an enum or struct.
pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let display_body = match &input.data {
        Data::Enum(data) => {
            let arms = data
                .variants
                .iter()
                .map(|variant| {
                    let message = require_message(&variant.attrs, variant)?;
                    let slots = field_slots(&variant.fields);
                    let template = Template::scan(&message, &slots)?;

                    let ident = &variant.ident;
                    let pattern =
                        variant_pattern(quote!(Self::#ident), &variant.fields, &slots, &template.used);
                    let write = template.write_call();
                    Ok(quote! { #pattern => #write, })
                })
                .collect::<syn::Result<Vec<_>>>()?;

            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
        Data::Struct(data) => {
            let message = require_message(&input.attrs, &input.ident)?;
            let slots = field_slots(&data.fields);
            let template = Template::scan(&message, &slots)?;

            // Bind only the fields the message mentions; inline capture in
            // the rewritten template picks the bindings up.
            let bindings = slots.iter().zip(&template.used).filter(|(_, used)| **used).map(
                |(slot, _)| {
                    let binder = &slot.binder;
                    let member = &slot.member;
                    quote! { let #binder = &self.#member; }
                },
            );
            let write = template.write_call();

            quote! {
                #(#bindings)*
                #write
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "Error derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                #display_body
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
    })
}

/// Finds the mandatory `#[error("...")]` attribute.
fn require_message<T: quote::ToTokens>(
    attrs: &[syn::Attribute],
    target: &T,
) -> syn::Result<LitStr> {
    let Some(attr) = attrs.iter().find(|attr| attr.path().is_ident("error")) else {
        return Err(syn::Error::new_spanned(
            target,
            "missing #[error(\"...\")] attribute; every error must declare a display message",
        ));
    };

    attr.parse_args::<LitStr>().map_err(|_| {
        syn::Error::new_spanned(
            attr,
            "expected a string literal, e.g. #[error(\"store failure: {0}\")]",
        )
    })
}

/// One field of the type being derived: how to bind it and how the message
/// may refer to it.
struct FieldSlot {
    binder: Ident,
    member: Member,
    name: Option<String>,
}

fn field_slots(fields: &Fields) -> Vec<FieldSlot> {
    fields
        .iter()
        .enumerate()
        .map(|(index, field)| match &field.ident {
            Some(ident) => FieldSlot {
                binder: ident.clone(),
                member: Member::from(ident.clone()),
                name: Some(ident.to_string()),
            },
            None => FieldSlot {
                binder: format_ident!("value_{}", index),
                member: Member::from(index),
                name: None,
            },
        })
        .collect()
}

/// An `#[error]` template resolved against the fields it formats.
struct Template {
    /// The message with every placeholder rewritten to a binder name, so
    /// the generated `write!` needs no argument list.
    literal: LitStr,
    /// Per field, whether the message references it.
    used: Vec<bool>,
}

impl Template {
    /// Scans the template, resolving `{}`/`{N}`/`{name}` placeholders
    /// (with optional `:spec` suffixes) to field slots.
    fn scan(message: &LitStr, slots: &[FieldSlot]) -> syn::Result<Template> {
        let text = message.value();
        let mut rewritten = String::with_capacity(text.len());
        let mut used = vec![false; slots.len()];
        let mut auto_index = 0usize;

        let fail = |reason: String| syn::Error::new(message.span(), reason);

        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    rewritten.push_str("{{");
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    rewritten.push_str("}}");
                }
                '}' => return Err(fail("unmatched `}` in error message".into())),
                '{' => {
                    let mut head = String::new();
                    let mut spec = String::new();
                    let mut in_spec = false;
                    let mut closed = false;
                    for c in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            ':' if !in_spec => in_spec = true,
                            _ if in_spec => spec.push(c),
                            _ => head.push(c),
                        }
                    }
                    if !closed {
                        return Err(fail("unclosed `{` in error message".into()));
                    }

                    let index = if head.is_empty() {
                        let index = auto_index;
                        auto_index += 1;
                        index
                    } else if head.chars().all(|c| c.is_ascii_digit()) {
                        head.parse::<usize>()
                            .map_err(|_| fail(format!("bad placeholder index `{head}`")))?
                    } else {
                        slots
                            .iter()
                            .position(|slot| slot.name.as_deref() == Some(head.as_str()))
                            .ok_or_else(|| {
                                fail(format!("message references unknown field `{head}`"))
                            })?
                    };

                    let slot = slots.get(index).ok_or_else(|| {
                        fail(format!(
                            "message references field {index} but only {} exist",
                            slots.len()
                        ))
                    })?;
                    used[index] = true;

                    rewritten.push('{');
                    rewritten.push_str(&slot.binder.to_string());
                    if in_spec {
                        rewritten.push(':');
                        rewritten.push_str(&spec);
                    }
                    rewritten.push('}');
                }
                _ => rewritten.push(c),
            }
        }

        Ok(Template {
            literal: LitStr::new(&rewritten, message.span()),
            used,
        })
    }

    /// The `write!` invocation rendering this template; placeholders are
    /// satisfied by inline capture of the surrounding bindings.
    fn write_call(&self) -> TokenStream2 {
        let literal = &self.literal;
        quote! { ::std::write!(f, #literal) }
    }
}

/// The match pattern for one variant, binding exactly the fields its
/// message uses.
fn variant_pattern(
    path: TokenStream2,
    fields: &Fields,
    slots: &[FieldSlot],
    used: &[bool],
) -> TokenStream2 {
    match fields {
        Fields::Unit => path,
        Fields::Named(_) => {
            let bound = slots
                .iter()
                .zip(used)
                .filter(|(_, used)| **used)
                .map(|(slot, _)| &slot.binder);
            quote!(#path { #(#bound,)* .. })
        }
        Fields::Unnamed(_) => {
            if used.iter().any(|used| *used) {
                let positions = slots.iter().zip(used).map(|(slot, used)| {
                    if *used {
                        let binder = &slot.binder;
                        quote!(#binder)
                    } else {
                        quote!(_)
                    }
                });
                quote!(#path( #(#positions),* ))
            } else {
                quote!(#path(..))
            }
        }
    }
}
