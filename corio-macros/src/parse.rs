use proc_macro2::{TokenStream, TokenTree};
use quote::ToTokens;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Signature, Visibility, braced};

pub(crate) fn lit_to_string(lit: &syn::Lit, field: &str) -> syn::Result<String> {
    match lit {
        syn::Lit::Str(s) => Ok(s.value()),
        _ => Err(syn::Error::new(
            lit.span(),
            format!("`{field}` expects a string literal"),
        )),
    }
}

pub(crate) fn lit_to_usize(lit: &syn::Lit, field: &str) -> syn::Result<usize> {
    match lit {
        syn::Lit::Int(int) => int.base10_parse::<usize>().map_err(|e| {
            syn::Error::new(lit.span(), format!("`{field}` is not a valid integer: {e}"))
        }),
        _ => Err(syn::Error::new(
            lit.span(),
            format!("`{field}` expects an integer literal"),
        )),
    }
}

/// Matches `#[test]`, `#[core::prelude::*::test]` and `#[std::prelude::*::test]`.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let syn::Meta::Path(path) = &attr.meta else {
        return false;
    };

    let segments = path
        .segments
        .iter()
        .map(|segment| segment.arguments.is_none().then(|| segment.ident.to_string()))
        .collect::<Option<Vec<_>>>();

    match segments.as_deref() {
        Some([single]) => path.leading_colon.is_none() && single == "test",
        Some([root, prelude, _, test]) => {
            (root == "core" || root == "std") && prelude == "prelude" && test == "test"
        }
        _ => false,
    }
}

/// A function whose body is kept as raw token streams, one per statement.
///
/// Parsing the statements lazily keeps the expansion working while the body
/// is half-written in an editor.
pub(crate) struct ItemFn {
    outer_attrs: Vec<Attribute>,
    vis: Visibility,
    pub(crate) sig: Signature,
    brace_token: syn::token::Brace,
    inner_attrs: Vec<Attribute>,
    pub(crate) stmts: Vec<TokenStream>,
}

impl ItemFn {
    pub(crate) fn attrs(&self) -> impl Iterator<Item = &Attribute> {
        self.outer_attrs.iter().chain(&self.inner_attrs)
    }

    pub(crate) fn body(&self) -> Body<'_> {
        Body {
            brace_token: self.brace_token,
            stmts: &self.stmts,
        }
    }

    /// Emits the function with `prelude` and `run` as its new body.
    pub(crate) fn into_tokens(self, extra_attrs: TokenStream, prelude: TokenStream, run: TokenStream) -> TokenStream {
        let mut tokens = TokenStream::new();

        for attr in self.outer_attrs {
            attr.to_tokens(&mut tokens);
        }

        // Inner attributes are not allowed on the generated block.
        for mut attr in self.inner_attrs {
            attr.style = syn::AttrStyle::Outer;
            attr.to_tokens(&mut tokens);
        }

        extra_attrs.to_tokens(&mut tokens);
        self.vis.to_tokens(&mut tokens);
        self.sig.to_tokens(&mut tokens);

        self.brace_token.surround(&mut tokens, |tokens| {
            prelude.to_tokens(tokens);
            run.to_tokens(tokens);
        });

        tokens
    }
}

impl Parse for ItemFn {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let outer_attrs = input.call(Attribute::parse_outer)?;
        let vis = input.parse()?;
        let sig = input.parse()?;

        let content;
        let brace_token = braced!(content in input);
        let inner_attrs = Attribute::parse_inner(&content)?;

        let mut stmts = Vec::new();
        let mut stmt = TokenStream::new();

        while !content.is_empty() {
            if let Some(semi) = content.parse::<Option<syn::Token![;]>>()? {
                semi.to_tokens(&mut stmt);
                stmts.push(std::mem::take(&mut stmt));
                continue;
            }
            stmt.extend([content.parse::<TokenTree>()?]);
        }

        if !stmt.is_empty() {
            stmts.push(stmt);
        }

        Ok(ItemFn {
            outer_attrs,
            vis,
            sig,
            brace_token,
            inner_attrs,
            stmts,
        })
    }
}

pub(crate) struct Body<'a> {
    brace_token: syn::token::Brace,
    stmts: &'a [TokenStream],
}

impl ToTokens for Body<'_> {
    fn to_tokens(&self, tokens: &mut TokenStream) {
        self.brace_token.surround(tokens, |tokens| {
            for stmt in self.stmts {
                stmt.to_tokens(tokens);
            }
        });
    }
}
