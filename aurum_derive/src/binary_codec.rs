//! Derive macro for deterministic binary serialization.
//!
//! Generates `Encode` and `Decode` implementations for structs and enums.
//! Struct fields are serialized in declaration order with no framing; enums
//! are serialized as a one-byte tag followed by the variant's fields. The
//! byte-level format of each field comes from `types::encoding`.
//!
//! Named and tuple structs share one code path: fields are addressed as
//! `syn::Member`s, and tuple fields are constructed through numeric field
//! names (`Self { 0: ..., 1: ... }`), which the struct-expression grammar
//! accepts for tuple structs.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DataEnum, DeriveInput, Fields, Ident, Member, parse_macro_input};

/// Derives `Encode` and `Decode` for a struct or enum.
///
/// ```ignore
/// #[derive(BinaryCodec)]
/// pub struct BlockHeader {
///     pub prev_hash: Hash,
///     pub height: u32,
/// }
/// ```
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let (encode_body, decode_body) = match &input.data {
        Data::Struct(data) => struct_bodies(&data.fields),
        Data::Enum(data) => enum_bodies(data)?,
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "BinaryCodec derive does not support unions",
            ));
        }
    };

    Ok(codec_impl(input, encode_body, decode_body))
}

/// Splices generated method bodies into the two trait impls.
fn codec_impl(input: &DeriveInput, encode_body: TokenStream2, decode_body: TokenStream2) -> TokenStream2 {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #encode_body
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn decode(
                input: &mut &[u8],
            ) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                #decode_body
            }
        }
    }
}

/// Bodies for a struct of any shape: encode every field through `self`,
/// decode by rebuilding the value field by field.
fn struct_bodies(fields: &Fields) -> (TokenStream2, TokenStream2) {
    let members = members_of(fields);
    let encode = quote! {
        #( crate::types::encoding::Encode::encode(&self.#members, out); )*
    };

    let ctor = construct_value(quote!(Self), fields);
    let decode = quote! { Ok(#ctor) };

    (encode, decode)
}

/// Bodies for an enum: match on the variant to write its tag and fields;
/// decode dispatches on the tag.
///
/// Tags follow Rust's discriminant assignment (an explicit value, otherwise
/// the previous tag plus one) and must fit the one-byte wire tag; running
/// past 255 is reported at compile time instead of wrapping.
fn enum_bodies(data: &DataEnum) -> syn::Result<(TokenStream2, TokenStream2)> {
    let mut next_tag: u16 = 0;
    let mut encode_arms = Vec::with_capacity(data.variants.len());
    let mut decode_arms = Vec::with_capacity(data.variants.len());

    for variant in &data.variants {
        let tag = match &variant.discriminant {
            Some((_, expr)) => explicit_tag(expr)?,
            None => next_tag,
        };
        if tag > u8::MAX as u16 {
            return Err(syn::Error::new_spanned(
                variant,
                "variant tag does not fit the one-byte wire encoding",
            ));
        }
        next_tag = tag + 1;
        let tag = tag as u8;

        let ident = &variant.ident;
        let binders = binders_of(&variant.fields);
        let pattern = variant_pattern(ident, &variant.fields, &binders);

        encode_arms.push(quote! {
            #pattern => {
                crate::types::encoding::Encode::encode(&#tag, out);
                #( crate::types::encoding::Encode::encode(#binders, out); )*
            }
        });

        let ctor = construct_value(quote!(Self::#ident), &variant.fields);
        decode_arms.push(quote! { #tag => Ok(#ctor), });
    }

    let encode = quote! {
        match self {
            #(#encode_arms)*
        }
    };
    let decode = quote! {
        let tag: u8 = crate::types::encoding::Decode::decode(input)?;
        match tag {
            #(#decode_arms)*
            _ => Err(crate::types::encoding::DecodeError::InvalidValue),
        }
    };

    Ok((encode, decode))
}

/// A constructor expression that decodes each field in declaration order.
///
/// Unit shapes construct through the bare path; everything else uses a
/// struct expression keyed by member, so named and tuple fields need no
/// separate handling.
fn construct_value(path: TokenStream2, fields: &Fields) -> TokenStream2 {
    if matches!(fields, Fields::Unit) {
        return path;
    }

    let members = members_of(fields);
    quote! {
        #path {
            #( #members: crate::types::encoding::Decode::decode(input)?, )*
        }
    }
}

/// Field accessors in declaration order: idents for named fields, indices
/// for tuple fields.
fn members_of(fields: &Fields) -> Vec<Member> {
    fields
        .iter()
        .enumerate()
        .map(|(index, field)| match &field.ident {
            Some(ident) => Member::from(ident.clone()),
            None => Member::from(index),
        })
        .collect()
}

/// Binding names for a variant's fields in a match pattern.
fn binders_of(fields: &Fields) -> Vec<Ident> {
    fields
        .iter()
        .enumerate()
        .map(|(index, field)| match &field.ident {
            Some(ident) => ident.clone(),
            None => format_ident!("value_{}", index),
        })
        .collect()
}

/// The pattern matching one enum variant with all fields bound.
fn variant_pattern(ident: &Ident, fields: &Fields, binders: &[Ident]) -> TokenStream2 {
    match fields {
        Fields::Unit => quote!(Self::#ident),
        Fields::Unnamed(_) => quote!(Self::#ident( #(#binders),* )),
        Fields::Named(_) => quote!(Self::#ident { #(#binders),* }),
    }
}

/// Evaluates an explicit discriminant, which must be a plain integer
/// literal.
fn explicit_tag(expr: &syn::Expr) -> syn::Result<u16> {
    if let syn::Expr::Lit(expr_lit) = expr {
        if let syn::Lit::Int(int) = &expr_lit.lit {
            return int
                .base10_parse::<u16>()
                .map_err(|_| syn::Error::new_spanned(expr, "discriminant is out of tag range"));
        }
    }
    Err(syn::Error::new_spanned(
        expr,
        "discriminant must be an integer literal",
    ))
}
