use proc_macro2::TokenStream;
use quote::quote;
use syn::{DeriveInput, Fields, LitStr, Path, spanned::Spanned};

pub fn derive_tensor_args(input: DeriveInput) -> TokenStream {
    // retrieve struct field information
    let fields = match &input.data {
        syn::Data::Struct(data_struct) => &data_struct.fields,
        _ => {
            return syn::Error::new(input.span(), "`TensorArgs` can only be derived for structs")
                .to_compile_error();
        }
    };
    let fields = match fields {
        Fields::Named(fields_named) => &fields_named.named,
        _ => {
            return syn::Error::new(
                fields.span(),
                "`TensorArgs` can only be derived for structs with named fields",
            )
            .to_compile_error();
        }
    };

    // split fields into tensor fields and skipped ones
    let mut tensors = Vec::new();
    let mut skipped = Vec::new();
    for field in fields {
        let mut skip = false;
        for attr in field.attrs.iter().filter(|a| a.path().is_ident("tensor_args")) {
            let result = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    skip = true;
                    Ok(())
                } else {
                    Err(meta.error("unexpected field attribute; supported is `skip`"))
                }
            });
            if let Err(err) = result {
                return err.to_compile_error();
            }
        }
        match skip {
            true => skipped.push(&field.ident),
            false => tensors.push(&field.ident),
        }
    }

    // parse tensor_args attributes on the struct
    let mut crate_name = None;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("tensor_args")) {
        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                crate_name = Some(s.parse::<Path>()?);
                Ok(())
            } else {
                Err(meta.error("unexpected attribute; supported is `crate`"))
            }
        });
        if let Err(err) = result {
            return err.to_compile_error();
        }
    }
    let base_path = match crate_name {
        Some(path) => quote!(#path::loom),
        None => quote!(::mosaic::loom),
    };

    let name = input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    quote! {
        impl #impl_generics #base_path::ops::TensorArgs for #name #ty_generics #where_clause {
            fn tensors(&self) -> Vec<&#base_path::tensor::Tensor> {
                let mut tensors = Vec::new();
                #(#base_path::ops::TensorField::visit(&self.#tensors, &mut tensors);)*
                tensors
            }

            fn map_tensors(
                &self,
                f: &mut dyn FnMut(
                    &#base_path::tensor::Tensor,
                ) -> Result<#base_path::tensor::Tensor, #base_path::tensor::TensorError>,
            ) -> Result<Self, #base_path::tensor::TensorError> {
                Ok(Self {
                    #(#tensors: #base_path::ops::TensorField::transform(&self.#tensors, f)?,)*
                    #(#skipped: ::core::clone::Clone::clone(&self.#skipped),)*
                })
            }
        }
    }
}
