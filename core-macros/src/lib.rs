//! Proc-macro helpers for registering command handlers.
//!
//! Grounded on `t51core_proc`'s attribute-macro structure (parse the
//! annotated item, emit it back out alongside a generated companion
//! item), repurposed from generating ECS system contexts to generating a
//! `(type_name, HandlerFn)` registration entry for `instrument_core`'s
//! command registry.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn, LitStr};

/// Wrap a handler function so it can be registered against a message
/// type name without hand-writing the `Arc<dyn Fn...>` boilerplate.
///
/// ```ignore
/// #[command_handler("StoreValue")]
/// fn store_value(ctx: Context<'_, Runtime>) -> CommandOutcome {
///     // ...
/// }
/// ```
///
/// expands the function body in place and adds a sibling
/// `store_value_entry()` that returns `(&'static str, HandlerFn<Runtime>)`
/// suitable for `Registry::register`'s call site — `Runtime` is inferred
/// from the handler's own `Context<'_, R>` parameter type.
#[proc_macro_attribute]
pub fn command_handler(attr: TokenStream, item: TokenStream) -> TokenStream {
    let type_name = parse_macro_input!(attr as LitStr);
    let func = parse_macro_input!(item as ItemFn);

    let fn_ident = &func.sig.ident;
    let entry_ident = syn::Ident::new(&format!("{}_entry", fn_ident), fn_ident.span());
    let runtime_ty = match extract_runtime_type(&func) {
        Some(ty) => ty,
        None => {
            return syn::Error::new_spanned(
                &func.sig,
                "command_handler expects exactly one parameter of type Context<'_, R>",
            )
            .to_compile_error()
            .into();
        }
    };

    let expanded = quote! {
        #func

        pub fn #entry_ident() -> (&'static str, ::instrument_core::command::HandlerFn<#runtime_ty>) {
            (#type_name, ::std::sync::Arc::new(#fn_ident))
        }
    };

    expanded.into()
}

fn extract_runtime_type(func: &ItemFn) -> Option<syn::Type> {
    let arg = func.sig.inputs.iter().next()?;
    let pat_ty = match arg {
        syn::FnArg::Typed(pat_ty) => pat_ty,
        _ => return None,
    };
    let ty_path = match &*pat_ty.ty {
        syn::Type::Path(p) => p,
        _ => return None,
    };
    let segment = ty_path.path.segments.last()?;
    if segment.ident != "Context" {
        return None;
    }
    let args = match &segment.arguments {
        syn::PathArguments::AngleBracketed(args) => args,
        _ => return None,
    };
    // Context<'a, R>: second generic argument is the runtime type.
    args.args.iter().find_map(|arg| match arg {
        syn::GenericArgument::Type(ty) => Some(ty.clone()),
        _ => None,
    })
}
