use proc_macro2::TokenStream;
use quote::quote;
use syn::{DeriveInput, Fields, LitStr, Path, Type, spanned::Spanned};

pub fn derive_program_factories(input: DeriveInput) -> TokenStream {
    let variants = match &input.data {
        syn::Data::Enum(data_enum) => &data_enum.variants,
        _ => {
            return syn::Error::new(
                input.span(),
                "`ProgramFactories` can only be derived for enums",
            )
            .to_compile_error();
        }
    };
    if variants.is_empty() {
        return syn::Error::new(input.span(), "at least one program factory is required")
            .to_compile_error();
    }

    // every variant wraps exactly one program factory
    let mut idents = Vec::new();
    let mut types: Vec<&Type> = Vec::new();
    for variant in variants {
        match &variant.fields {
            Fields::Unnamed(fields) if fields.unnamed.len() == 1 => {
                idents.push(&variant.ident);
                types.push(&fields.unnamed[0].ty);
            }
            _ => {
                return syn::Error::new(
                    variant.span(),
                    "each variant must wrap exactly one program factory, e.g. `Variant(Factory)`",
                )
                .to_compile_error();
            }
        }
    }
    let indices = 0..idents.len();

    // parse program_factories attributes
    let mut crate_name = None;
    let mut op = None;
    for attr in input
        .attrs
        .iter()
        .filter(|a| a.path().is_ident("program_factories"))
    {
        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                crate_name = Some(s.parse::<Path>()?);
                Ok(())
            } else if meta.path.is_ident("op") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                op = Some(s.parse::<Type>()?);
                Ok(())
            } else {
                Err(meta.error("unexpected attribute; supported are `crate` and `op`"))
            }
        });
        if let Err(err) = result {
            return err.to_compile_error();
        }
    }
    let Some(op) = op else {
        return syn::Error::new(
            input.span(),
            "missing `#[program_factories(op = \"...\")]` attribute",
        )
        .to_compile_error();
    };
    let base_path = match crate_name {
        Some(path) => quote!(#path::loom),
        None => quote!(::mosaic::loom),
    };
    let ops = quote!(#base_path::ops);
    let cache = quote!(#base_path::cache);

    let name = input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let index_arms = idents
        .iter()
        .zip(indices.clone())
        .map(|(ident, index)| quote! { Self::#ident(_) => #index, });
    let from_index_arms = idents.iter().zip(indices).map(|(ident, index)| {
        quote! { #index => Some(Self::#ident(::core::default::Default::default())), }
    });
    let create_arms = idents.iter().zip(types.iter()).map(|(ident, ty)| {
        quote! {
            Self::#ident(_) => {
                let cached = <#ty as #ops::ProgramFactory<#op>>::create(
                    context, attributes, args, output,
                )?;
                Ok(#cache::CacheEntry::new(cached, index))
            }
        }
    });
    let override_arms = idents.iter().zip(types.iter()).map(|(ident, ty)| {
        quote! {
            Self::#ident(_) => {
                let cached = entry.downcast_mut::<<#ty as #ops::ProgramFactory<#op>>::Shared>()?;
                <#ty as #ops::ProgramFactory<#op>>::override_runtime_arguments(
                    cached, attributes, args, output,
                )
            }
        }
    });

    quote! {
        impl #impl_generics #ops::ProgramFactories<#op> for #name #ty_generics #where_clause {
            fn index(&self) -> usize {
                match self {
                    #(#index_arms)*
                }
            }

            fn from_index(index: usize) -> Option<Self> {
                match index {
                    #(#from_index_arms)*
                    _ => None,
                }
            }

            fn create(
                &self,
                context: &#ops::FactoryContext,
                attributes: &<#op as #ops::DeviceOperation>::Attributes,
                args: &<#op as #ops::DeviceOperation>::TensorArgs,
                output: &<#op as #ops::DeviceOperation>::Output,
            ) -> Result<#cache::CacheEntry, #ops::OpError> {
                let index = #ops::ProgramFactories::<#op>::index(self);
                match self {
                    #(#create_arms)*
                }
            }

            fn override_runtime_arguments(
                &self,
                entry: &mut #cache::CacheEntry,
                attributes: &<#op as #ops::DeviceOperation>::Attributes,
                args: &<#op as #ops::DeviceOperation>::TensorArgs,
                output: &<#op as #ops::DeviceOperation>::Output,
            ) -> Result<(), #ops::OpError> {
                match self {
                    #(#override_arms)*
                }
            }
        }
    }
}
