use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod args;
mod factory;

#[proc_macro_derive(TensorArgs, attributes(tensor_args))]
pub fn derive_tensor_args(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = args::derive_tensor_args(input);
    expanded.into()
}

#[proc_macro_derive(ProgramFactories, attributes(program_factories))]
pub fn derive_program_factories(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = factory::derive_program_factories(input);
    expanded.into()
}
