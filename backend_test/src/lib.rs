use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    parse::Parser, punctuated::Punctuated, spanned::Spanned, FnArg, Ident, ItemFn, Pat,
    Signature, Token, Type,
};

/// Transform an asynchronous test into a synchronous one and inject dependencies.
///
/// Every test gets a fresh in-memory ballot store and a Rocket instance
/// over it, configured with `Config::example()`.
///
/// Injectable dependencies are [`rocket::local::asynchronous::Client`] and
/// [`crate::store::Ballots`].
///
/// Arguments:
/// - `admin`: log the client in as the administrator.
/// - `voter`: give the client an anonymous voter session.
/// - `untracked`: turn voter tracking off.
#[proc_macro_attribute]
pub fn backend_test(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = syn::parse_macro_input!(input as ItemFn);

    // Extract the requested options.
    let options = match Punctuated::<Ident, Token![,]>::parse_terminated.parse(args) {
        Ok(options) => options,
        Err(err) => return err.into_compile_error().into(),
    };
    let mut logins = Vec::new();
    let mut voter_tracking = true;
    for option in options {
        if option == "admin" {
            logins.push(quote! {
                let response = rocket_client
                    .post(uri!(crate::api::auth::authenticate))
                    .header(rocket::http::ContentType::JSON)
                    .body(rocket::serde::json::json!(crate::model::api::admin::AdminCredentials::example()).to_string())
                    .dispatch()
                    .await;
                assert_eq!(rocket::http::Status::Ok, response.status(), "admin login failed");
            });
        } else if option == "voter" {
            logins.push(quote! {
                let response = rocket_client
                    .post(uri!(crate::api::auth::voter_session))
                    .dispatch()
                    .await;
                assert_eq!(rocket::http::Status::Ok, response.status(), "voter session failed");
            });
        } else if option == "untracked" {
            voter_tracking = false;
        } else {
            return syn::Error::new(
                option.span(),
                "Expected any of `admin`, `voter` or `untracked`",
            )
            .into_compile_error()
            .into();
        }
    }

    // Extract parameters to inject and reject invalid function signatures.
    let test_args = match check_sig(item_fn.sig.clone()) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    // Rewrite the test function.
    quote! {
        #[test]
        fn #name() {
            /// Test setup.
            async fn setup() -> (rocket::local::asynchronous::Client, crate::store::Ballots) {
                log4rs_test_utils::test_logging::init_logging_once_for(
                    ["ballotbox_backend"],
                    None,
                    None,
                );

                let ballots = crate::store::Ballots::in_memory();
                let mut config = crate::config::Config::example();
                config.voter_tracking = #voter_tracking;
                let rocket_client = rocket::local::asynchronous::Client::tracked(
                    crate::rocket_for_store(ballots.clone(), config),
                )
                .await
                .unwrap();

                // Each login in its own scope, so no response outlives its borrow of the client.
                #({ #logins })*

                (rocket_client, ballots)
            }

            /// The test itself.
            #item_fn

            let runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("rocket-worker-test-thread")
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                #[allow(unused_variables)]
                let (rocket_client, ballots) = setup().await;
                #new_name(#(#test_args),*).await
            });
        }
    }
    .into()
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject unknown parameters.
fn check_sig(sig: Signature) -> Result<Vec<TokenStream2>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut has_client = false;
    let mut has_ballots = false;
    let mut args = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let Pat::Ident(_) = &*pat_type.pat {
                if let Type::Path(type_path) = &*pat_type.ty {
                    if let Some(type_ident) = type_path.path.get_ident() {
                        if type_ident == "Client" {
                            if has_client {
                                return Err(syn::Error::new(input.span(), "Test cannot accept more than one `rocket::local::asynchronous::Client`"));
                            }
                            has_client = true;
                            args.push(quote! { rocket_client });
                            continue;
                        } else if type_ident == "Ballots" {
                            if has_ballots {
                                return Err(syn::Error::new(
                                    input.span(),
                                    "Test cannot accept more than one `Ballots`",
                                ));
                            }
                            has_ballots = true;
                            args.push(quote! { ballots });
                            continue;
                        }
                    }
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `client_ident: Client` or `ballots_ident: Ballots`",
        ));
    }

    Ok(args)
}
