use crate::parse::{ItemFn, is_test_attribute, lit_to_string, lit_to_usize};
use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;

type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    Main,
    Test,
}

impl Entry {
    fn name(self) -> &'static str {
        match self {
            Entry::Main => "corio::main",
            Entry::Test => "corio::test",
        }
    }

    fn default_flavor(self) -> Flavor {
        match self {
            Entry::Main => Flavor::Stealing,
            Entry::Test => Flavor::Local,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Local,
    Stealing,
}

impl Flavor {
    fn parse(lit: &syn::Lit) -> syn::Result<Flavor> {
        match lit_to_string(lit, "flavor")?.as_str() {
            "local" => Ok(Flavor::Local),
            "stealing" => Ok(Flavor::Stealing),
            other => Err(syn::Error::new(
                lit.span(),
                format!("unknown runtime flavor `{other}`, expected `local` or `stealing`"),
            )),
        }
    }
}

struct Config {
    flavor: Flavor,
    worker_threads: Option<usize>,
}

/// Expands either attribute. On error the function is still emitted, with
/// the error appended, so IDEs keep resolving the body.
pub(crate) fn expand(args: TokenStream, item: TokenStream, entry: Entry) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(input) => input,
        Err(e) => return with_error(item, e),
    };

    let config = AttributeArgs::parse_terminated
        .parse2(args)
        .and_then(|args| parse_config(&input, args, entry));

    match config {
        Ok(config) => generate(input, entry, config),
        Err(e) => {
            let fallback = Config {
                flavor: entry.default_flavor(),
                worker_threads: None,
            };
            with_error(generate(input, entry, fallback), e)
        }
    }
}

fn parse_config(input: &ItemFn, args: AttributeArgs, entry: Entry) -> syn::Result<Config> {
    if input.sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            input.sig.fn_token,
            "the `async` keyword is missing from the function declaration",
        ));
    }

    match entry {
        Entry::Main if !input.sig.inputs.is_empty() => {
            return Err(syn::Error::new_spanned(
                &input.sig.inputs,
                "the main function cannot accept arguments",
            ));
        }
        Entry::Test => {
            if let Some(attr) = input.attrs().find(|attr| is_test_attribute(attr)) {
                return Err(syn::Error::new_spanned(
                    attr,
                    "duplicated test attribute, `#[corio::test]` already generates `#[test]`",
                ));
            }
        }
        Entry::Main => {}
    }

    let mut flavor = None;
    let mut worker_threads: Option<(usize, Span)> = None;

    for arg in args {
        let syn::Meta::NameValue(nv) = &arg else {
            return Err(syn::Error::new_spanned(
                &arg,
                format!("expected `name = value` arguments for `{}`", entry.name()),
            ));
        };

        let syn::Expr::Lit(syn::ExprLit { lit, .. }) = &nv.value else {
            return Err(syn::Error::new_spanned(&nv.value, "expected a literal"));
        };

        let name = nv
            .path
            .get_ident()
            .map(ToString::to_string)
            .unwrap_or_default();

        match name.as_str() {
            "flavor" if flavor.is_some() => {
                return Err(syn::Error::new_spanned(&nv, "`flavor` set multiple times"));
            }
            "flavor" => flavor = Some(Flavor::parse(lit)?),
            "worker_threads" if worker_threads.is_some() => {
                return Err(syn::Error::new_spanned(&nv, "`worker_threads` set multiple times"));
            }
            "worker_threads" => match lit_to_usize(lit, "worker_threads")? {
                0 => return Err(syn::Error::new(lit.span(), "`worker_threads` must be at least 1")),
                n => worker_threads = Some((n, lit.span())),
            },
            other => {
                return Err(syn::Error::new_spanned(
                    &nv.path,
                    format!("unknown option `{other}`, expected `flavor` or `worker_threads`"),
                ));
            }
        }
    }

    let flavor = flavor.unwrap_or(entry.default_flavor());

    if let (Flavor::Local, Some((_, span))) = (flavor, worker_threads) {
        return Err(syn::Error::new(
            span,
            format!(
                "`worker_threads` requires the stealing flavor, use `#[{}(flavor = \"stealing\", worker_threads = ..)]`",
                entry.name()
            ),
        ));
    }

    Ok(Config {
        flavor,
        worker_threads: worker_threads.map(|(n, _)| n),
    })
}

fn generate(mut input: ItemFn, entry: Entry, config: Config) -> TokenStream {
    input.sig.asyncness = None;

    // Point type errors at the last statement of the user's body.
    let span = input
        .stmts
        .last()
        .and_then(|stmt| stmt.clone().into_iter().next())
        .map_or_else(Span::call_site, |tt| tt.span());

    let mut builder = match config.flavor {
        Flavor::Local => quote_spanned! {span=> corio::runtime::Builder::new_local() },
        Flavor::Stealing => quote_spanned! {span=> corio::runtime::Builder::new_stealing() },
    };

    if let Some(n) = config.worker_threads {
        builder = quote_spanned! {span=> #builder.worker_threads(#n) };
    }

    let body = input.body();
    let output = match &input.sig.output {
        syn::ReturnType::Default => quote! { () },
        syn::ReturnType::Type(_, ty) => quote! { #ty },
    };

    // Tests share one `block_on` instantiation through a `dyn Future`.
    let root = match entry {
        Entry::Test => quote! {
            let root = ::std::pin::pin!(async #body);
            let root: ::core::pin::Pin<&mut dyn ::core::future::Future<Output = #output>> = root;
        },
        Entry::Main => quote! {
            let root = async #body;
        },
    };

    let run = quote_spanned! {span=>
        #[allow(clippy::expect_used, clippy::needless_return)]
        {
            return #builder
                .try_build()
                .expect("failed to build the corio runtime")
                .block_on(root);
        }
    };

    let test_attr = match entry {
        Entry::Test => quote! { #[::core::prelude::v1::test] },
        Entry::Main => quote! {},
    };

    input.into_tokens(test_attr, root, run)
}

fn with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}
