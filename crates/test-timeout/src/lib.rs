use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

/// Environment variable consulted when a test does not pin its own deadline.
const ENV_OVERRIDE: &str = "TEST_TIMEOUT_SECS";
const DEFAULT_SECS: u64 = 60;

/// Run a test under a wall-clock deadline.
///
/// Works on both plain and `async` test functions. Async bodies run on a
/// fresh current-thread Tokio runtime, so the test crate must depend on
/// `tokio` with the `rt` and `time` features. `#[test]` and `#[tokio::test]`
/// attributes on the item are absorbed.
///
/// ```ignore
/// #[test_timeout::timeout]
/// fn quick() {}
///
/// #[test_timeout::timeout(5)]
/// async fn bounded() {}
/// ```
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let pinned = if attr.is_empty() {
        None
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "timeout must be greater than zero")
                    .to_compile_error()
                    .into()
            }
            Ok(secs) => Some(secs),
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let deadline = deadline_expr(pinned);
    let is_async = sig.asyncness.take().is_some();
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let body = if is_async {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async move {
                tokio::time::timeout(deadline, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    } else {
        quote! { #block }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline: std::time::Duration = #deadline;
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(deadline) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", deadline)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn deadline_expr(pinned: Option<u64>) -> TokenStream2 {
    match pinned {
        Some(secs) => quote! { std::time::Duration::from_secs(#secs) },
        None => quote! {
            std::time::Duration::from_secs(
                std::env::var(#ENV_OVERRIDE)
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(#DEFAULT_SECS),
            )
        },
    }
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
