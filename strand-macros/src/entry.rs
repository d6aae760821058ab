use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;

use crate::parse::{ItemFn, is_test_attribute, parse_int, token_stream_with_error};

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

const DEFAULT_WORKER_THREADS: usize = 1;

/// Used when the attribute arguments are invalid, so that the expansion
/// stays close to the intended one and IDEs keep working.
const DEFAULT_ERROR_CONFIG: FinalConfig = FinalConfig {
    worker_threads: DEFAULT_WORKER_THREADS,
};

/// Expands
///
/// ```ignore
/// #[strand::test(worker_threads = 2)]
/// async fn my_test() -> anyhow::Result<()> { body }
/// ```
///
/// into a `#[test]` function building a task processor with 2 workers and
/// blocking on `body`.
pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args))
    };

    match config {
        Ok(config) => expand(input, config),
        Err(e) => token_stream_with_error(expand(input, DEFAULT_ERROR_CONFIG), e),
    }
}

struct FinalConfig {
    worker_threads: usize,
}

#[derive(Default)]
struct ConfigBuilder {
    worker_threads: Option<usize>,
}

impl ConfigBuilder {
    fn set_worker_threads(&mut self, lit: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.worker_threads.is_some() {
            return Err(syn::Error::new(span, "`worker_threads` set multiple times."));
        }

        let worker_threads = parse_int(lit, span, "worker_threads")?;
        if worker_threads == 0 {
            return Err(syn::Error::new(span, "`worker_threads` may not be 0."));
        }
        self.worker_threads = Some(worker_threads);
        Ok(())
    }

    fn build(self) -> FinalConfig {
        FinalConfig {
            worker_threads: self.worker_threads.unwrap_or(DEFAULT_WORKER_THREADS),
        }
    }
}

fn build_config(input: &ItemFn, args: AttributeArgs) -> Result<FinalConfig, syn::Error> {
    if input.sig.asyncness.is_none() {
        let msg = "the `async` keyword is missing from the function declaration";
        return Err(syn::Error::new_spanned(input.sig.fn_token, msg));
    }
    if !input.sig.inputs.is_empty() {
        let msg = "test functions cannot accept arguments";
        return Err(syn::Error::new_spanned(&input.sig.inputs, msg));
    }

    let mut config = ConfigBuilder::default();

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&namevalue, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                match ident.as_str() {
                    "worker_threads" => {
                        config.set_worker_threads(lit.clone(), syn::spanned::Spanned::span(lit))?;
                    }
                    name => {
                        let msg = format!(
                            "Unknown attribute {name} is specified; expected `worker_threads`"
                        );
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let msg = match path.get_ident().map(|i| i.to_string()).as_deref() {
                    Some("worker_threads") => {
                        "The `worker_threads` attribute requires an argument.".to_string()
                    }
                    _ => "Unknown attribute; expected `worker_threads = N`".to_string(),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    Ok(config.build())
}

fn expand(mut input: ItemFn, config: FinalConfig) -> TokenStream {
    input.sig.asyncness = None;

    // If type mismatch occurs, the current rustc points to the last statement.
    let (last_stmt_start_span, last_stmt_end_span) = {
        let mut last_stmt = input.stmts.last().cloned().unwrap_or_default().into_iter();

        // `Span` on stable Rust only points to the first token, use the
        // first and last spans like `syn::Error::new_spanned` does.
        let start = last_stmt.next().map_or_else(Span::call_site, |t| t.span());
        let end = last_stmt.last().map_or(start, |t| t.span());
        (start, end)
    };

    let worker_threads = config.worker_threads;
    let processor = quote_spanned! {last_stmt_start_span=>
        strand::runtime::Builder::new()
            .name("test")
            .worker_threads(#worker_threads)
    };

    let output_type = match &input.sig.output {
        // `()` when the function does not declare a return type.
        syn::ReturnType::Default => quote! { () },
        syn::ReturnType::Type(_, ret_type) => quote! { #ret_type },
    };

    // The body runs as a task: it must be `Send + 'static`. Boxing it keeps
    // a single `block_on` instantiation across all tests.
    let body = input.body();
    let body = quote! {
        let body: ::std::pin::Pin<
            ::std::boxed::Box<dyn ::core::future::Future<Output = #output_type> + ::core::marker::Send>,
        > = ::std::boxed::Box::pin(async move #body);
    };

    // This explicit `return` is intentional. See tokio-rs/tokio#4636
    let last_block = quote_spanned! {last_stmt_end_span=>
        #[allow(clippy::expect_used, clippy::needless_return)]
        {
            return #processor
                .try_build()
                .expect("failed to build the test task processor")
                .block_on(body);
        }
    };

    let generated_attrs = quote! {
        #[::core::prelude::v1::test]
    };

    input.into_tokens(generated_attrs, body, last_block)
}
