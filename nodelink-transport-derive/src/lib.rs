//! Proc-macro for nodelink remote service interfaces.
//!
//! This crate provides the `#[remote_service]` attribute macro that turns a
//! trait into a remotely callable service interface.
//!
//! # Example
//!
//! ```rust,ignore
//! use nodelink_transport::{CallError, remote_service};
//!
//! #[remote_service(name = "Calculator")]
//! pub trait Calculator {
//!     async fn add(&self, a: i64, b: i64) -> Result<i64, CallError>;
//!     async fn describe(&self) -> Result<String, CallError>;
//! }
//! ```
//!
//! This generates:
//! - The trait itself with `Send + Sync` supertraits and `#[async_trait]`
//! - `CalculatorProxy`, implementing the trait by issuing service calls
//! - `CalculatorDispatch<T>`, the dispatch table registered on the callee
//!   side for any `T: Calculator`

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    Expr, ExprLit, FnArg, GenericArgument, Ident, ItemTrait, Lit, PathArguments, ReturnType,
    TraitItem, Type, TypeParamBound, parse_macro_input, parse_quote,
};

/// Attribute macro for remote service interfaces.
///
/// # Attributes
///
/// - `#[remote_service(name = "...")]` - Optional. The service name used on
///   the wire; defaults to the trait name.
///
/// # Methods
///
/// Each method must be async with signature
/// `async fn name(&self, p1: T1, ...) -> Result<R, CallError>`. Parameter
/// and return types must be owned and serde-serializable. The method name
/// is the name used in calls and whitelists.
#[proc_macro_attribute]
pub fn remote_service(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attr = parse_macro_input!(attr as ServiceAttr);
    let item = parse_macro_input!(item as ItemTrait);

    match remote_service_impl(attr, item) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

/// Method info extracted from trait methods.
struct MethodInfo {
    name: Ident,
    param_types: Vec<Type>,
    return_type: Type,
    ok_type: Type,
}

fn remote_service_impl(
    attr: ServiceAttr,
    mut item: ItemTrait,
) -> syn::Result<proc_macro2::TokenStream> {
    let name = item.ident.clone();
    let service_name = attr.name.unwrap_or_else(|| name.to_string());
    let proxy_name = format_ident!("{}Proxy", name);
    let dispatch_name = format_ident!("{}Dispatch", name);

    let mut method_infos: Vec<MethodInfo> = Vec::new();
    for trait_item in &item.items {
        if let TraitItem::Fn(method) = trait_item {
            method_infos.push(extract_method_info(&method.sig)?);
        }
    }

    for bound in ["Send", "Sync"] {
        let present = item.supertraits.iter().any(|existing| match existing {
            TypeParamBound::Trait(t) => t.path.segments.last().is_some_and(|s| s.ident == bound),
            _ => false,
        });
        if !present {
            let ident = format_ident!("{}", bound);
            item.supertraits.push(parse_quote!(#ident));
        }
    }
    if item.colon_token.is_none() {
        item.colon_token = Some(Default::default());
    }

    let method_names: Vec<String> = method_infos.iter().map(|m| m.name.to_string()).collect();

    // Caller side: encode parameters, call, decode the Ok type.
    let proxy_methods = method_infos.iter().map(|m| {
        let method = &m.name;
        let method_str = method.to_string();
        let params: Vec<Ident> = (0..m.param_types.len())
            .map(|i| format_ident!("p{}", i))
            .collect();
        let param_types = &m.param_types;
        let return_type = &m.return_type;
        let ok_type = &m.ok_type;
        quote! {
            async fn #method(&self, #(#params: #param_types),*) -> #return_type {
                let parameters: Vec<Vec<u8>> = vec![
                    #(::nodelink_transport::rpc::codegen::encode_parameter(&#params)?),*
                ];
                let bytes = self.caller.call_method(#method_str, parameters).await?;
                ::nodelink_transport::rpc::codegen::decode_return::<#ok_type>(&bytes)
            }
        }
    });

    // Callee side: one match arm per method.
    let dispatch_arms = method_infos.iter().map(|m| {
        let method = &m.name;
        let method_str = method.to_string();
        let count = m.param_types.len();
        let params: Vec<Ident> = (0..count).map(|i| format_ident!("p{}", i)).collect();
        let indices = 0..count;
        let param_types = &m.param_types;
        quote! {
            #method_str => {
                ::nodelink_transport::rpc::codegen::check_parameter_count(
                    method, parameters, #count,
                )?;
                #(
                    let #params: #param_types =
                        ::nodelink_transport::rpc::codegen::decode_parameter(
                            method, parameters, #indices,
                        )?;
                )*
                ::nodelink_transport::rpc::codegen::encode_return(
                    method,
                    self.inner.#method(#(#params),*).await,
                )
            }
        }
    });

    let trait_vis = &item.vis;

    let expanded = quote! {
        #[::nodelink_transport::async_trait::async_trait]
        #item

        /// Caller-side proxy issuing service calls.
        ///
        /// Generated by `#[remote_service]`.
        #[derive(Clone, Debug)]
        #trait_vis struct #proxy_name {
            caller: ::nodelink_transport::RemoteServiceCaller,
        }

        impl ::nodelink_transport::ServiceProxy for #proxy_name {
            const SERVICE_NAME: &'static str = #service_name;

            fn from_caller(caller: ::nodelink_transport::RemoteServiceCaller) -> Self {
                Self { caller }
            }

            fn caller(&self) -> &::nodelink_transport::RemoteServiceCaller {
                &self.caller
            }
        }

        #[::nodelink_transport::async_trait::async_trait]
        impl #name for #proxy_name {
            #(#proxy_methods)*
        }

        /// Callee-side dispatch table over an implementation.
        ///
        /// Generated by `#[remote_service]`.
        #trait_vis struct #dispatch_name<T: ?Sized> {
            inner: ::std::sync::Arc<T>,
        }

        impl<T: ?Sized> #dispatch_name<T> {
            /// Service name used on the wire.
            pub const SERVICE_NAME: &'static str = #service_name;

            /// All declared method names.
            pub const METHODS: &'static [&'static str] = &[#(#method_names),*];

            /// Wrap an implementation.
            pub fn new(inner: ::std::sync::Arc<T>) -> Self {
                Self { inner }
            }
        }

        #[::nodelink_transport::async_trait::async_trait]
        impl<T: #name + ?Sized + 'static> ::nodelink_transport::ServiceDispatch
            for #dispatch_name<T>
        {
            fn service_name(&self) -> &str {
                #service_name
            }

            fn declared_methods(&self) -> &'static [&'static str] {
                Self::METHODS
            }

            async fn invoke(
                &self,
                method: &str,
                parameters: &[Vec<u8>],
            ) -> Result<Vec<u8>, ::nodelink_transport::InvocationError> {
                match method {
                    #(#dispatch_arms)*
                    _ => Err(::nodelink_transport::rpc::codegen::unknown_method(
                        #service_name,
                        method,
                    )),
                }
            }
        }
    };

    Ok(expanded)
}

/// Extract parameter and return types from a method signature.
///
/// Expected signature: `async fn name(&self, p: T, ...) -> Result<R, CallError>`
fn extract_method_info(sig: &syn::Signature) -> syn::Result<MethodInfo> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(sig, "Remote service methods must be async"));
    }

    let mut inputs = sig.inputs.iter();
    match inputs.next() {
        Some(FnArg::Receiver(receiver))
            if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => {
            return Err(syn::Error::new_spanned(
                sig,
                "Remote service method must have &self as first parameter",
            ));
        }
    }

    let mut param_types = Vec::new();
    for input in inputs {
        match input {
            FnArg::Typed(pat_type) => {
                if let Type::Reference(reference) = &*pat_type.ty {
                    return Err(syn::Error::new_spanned(
                        reference,
                        "Remote service parameters must be owned types",
                    ));
                }
                param_types.push((*pat_type.ty).clone());
            }
            FnArg::Receiver(receiver) => {
                return Err(syn::Error::new_spanned(receiver, "unexpected receiver"));
            }
        }
    }

    let return_type = match &sig.output {
        ReturnType::Type(_, ty) => (**ty).clone(),
        ReturnType::Default => {
            return Err(syn::Error::new_spanned(
                sig,
                "Remote service method must return Result<T, CallError>",
            ));
        }
    };
    let ok_type = extract_result_ok_type(&return_type)?;

    Ok(MethodInfo {
        name: sig.ident.clone(),
        param_types,
        return_type,
        ok_type,
    })
}

/// Extract the Ok type from `Result<T, E>`.
fn extract_result_ok_type(ty: &Type) -> syn::Result<Type> {
    if let Type::Path(type_path) = ty {
        if let Some(segment) = type_path.path.segments.last() {
            if segment.ident == "Result" {
                if let PathArguments::AngleBracketed(args) = &segment.arguments {
                    if let Some(GenericArgument::Type(ok_type)) = args.args.first() {
                        return Ok(ok_type.clone());
                    }
                }
            }
        }
    }

    Err(syn::Error::new_spanned(
        ty,
        "Remote service method must return Result<T, CallError>",
    ))
}

// ============================================================================
// Attribute Parsing
// ============================================================================

/// Parsed `remote_service` attribute.
struct ServiceAttr {
    name: Option<String>,
}

impl syn::parse::Parse for ServiceAttr {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(ServiceAttr { name: None });
        }
        let ident: Ident = input.parse()?;
        if ident != "name" {
            return Err(syn::Error::new_spanned(
                ident,
                "expected `name` in remote_service attribute",
            ));
        }
        let _eq: syn::Token![=] = input.parse()?;
        let value: Expr = input.parse()?;

        let name = match &value {
            Expr::Lit(ExprLit {
                lit: Lit::Str(lit_str),
                ..
            }) => lit_str.value(),
            _ => {
                return Err(syn::Error::new_spanned(
                    value,
                    "expected string literal for service name",
                ));
            }
        };

        Ok(ServiceAttr { name: Some(name) })
    }
}
