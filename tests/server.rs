mod common;

use async_h1d::{Body, Headers};
use common::{header, split_responses, Harness};
use futures_lite::io::{AsyncReadExt, AsyncWriteExt};
use http_types::StatusCode;
use pretty_assertions::assert_eq;

fn hello(h: &Harness, path: &str) {
    h.router.mount_proc(path, |_req, res| {
        Box::pin(async move {
            res.set_body("hi");
            Ok(())
        })
    });
}

#[async_std::test]
async fn get_with_known_length_keeps_alive() {
    let h = Harness::new();
    hello(&h, "/path");

    let out = h
        .exchange("GET /path HTTP/1.1\r\nHost: example.com:8080\r\n\r\n")
        .await;

    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
    assert!(out.contains("\r\nContent-Length: 2\r\n"));
    assert!(out.contains("\r\nConnection: Keep-Alive\r\n"));
    assert!(out.contains("\r\nServer: "));
    assert!(out.contains("\r\nDate: "));
    assert!(out.ends_with("\r\n\r\nhi"));
}

#[async_std::test]
async fn keep_alive_serves_pipelined_requests() {
    let h = Harness::new();
    h.router.mount_proc("/", |req, res| {
        Box::pin(async move {
            res.set_body(req.path().to_owned());
            Ok(())
        })
    });

    let out = h
        .exchange(
            "GET /one HTTP/1.1\r\nHost: example.com\r\n\r\n\
             GET /two HTTP/1.1\r\nHost: example.com\r\n\r\n\
             GET /three HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n\
             GET /four HTTP/1.1\r\nHost: example.com\r\n\r\n",
        )
        .await;

    let responses = split_responses(&out);
    let bodies: Vec<&str> = responses.iter().map(|(_, body)| body.as_str()).collect();
    assert_eq!(bodies, vec!["/one", "/two", "/three"]);
    assert_eq!(header(&responses[2].0, "connection"), Some("close"));
}

#[async_std::test]
async fn http_1_0_closes_after_one_request() {
    let h = Harness::new();
    hello(&h, "/");

    let out = h
        .exchange("GET / HTTP/1.0\r\n\r\nGET / HTTP/1.0\r\n\r\n")
        .await;

    let responses = split_responses(&out);
    assert_eq!(responses.len(), 1);
    assert!(responses[0].0.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(header(&responses[0].0, "connection"), Some("close"));
}

#[async_std::test]
async fn http_1_0_keep_alive_is_honored() {
    let h = Harness::new();
    hello(&h, "/");

    let out = h
        .exchange(
            "GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n\
             GET / HTTP/1.0\r\n\r\n",
        )
        .await;

    let responses = split_responses(&out);
    assert_eq!(responses.len(), 2);
    assert_eq!(header(&responses[0].0, "connection"), Some("Keep-Alive"));
    assert_eq!(header(&responses[1].0, "connection"), Some("close"));
}

#[async_std::test]
async fn server_speaking_http_1_0_closes() {
    let h = Harness::with_config(
        async_h1d::ServerConfig::default().with_http_version(async_h1d::HttpVersion::HTTP_1_0),
    );
    hello(&h, "/");

    let out = h
        .exchange("GET / HTTP/1.1\r\nHost: a\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n")
        .await;

    let responses = split_responses(&out);
    assert_eq!(responses.len(), 1);
    assert!(responses[0].0.starts_with("HTTP/1.0 200 OK\r\n"));
}

#[async_std::test]
async fn chunked_request_body() {
    let h = Harness::new();
    h.router.mount_proc("/", |req, res| {
        Box::pin(async move {
            let body = req.body().await?.to_vec();
            res.set_body(body);
            Ok(())
        })
    });

    let out = h
        .exchange(
            "POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
             5\r\nhello\r\n0\r\n\r\n",
        )
        .await;

    let responses = split_responses(&out);
    assert_eq!(responses[0].1, "hello");
}

#[async_std::test]
async fn unread_bodies_are_drained_between_requests() {
    let h = Harness::new();
    h.router.mount_proc("/", |req, res| {
        Box::pin(async move {
            res.set_body(req.method().to_string());
            Ok(())
        })
    });

    let out = h
        .exchange(
            "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 11\r\n\r\nhello world\
             POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n\
             GET / HTTP/1.1\r\nHost: a\r\n\r\n",
        )
        .await;

    let bodies: Vec<String> = split_responses(&out).into_iter().map(|(_, b)| b).collect();
    assert_eq!(bodies, vec!["POST", "POST", "GET"]);
}

#[async_std::test]
async fn chunked_response_body() {
    let h = Harness::new();
    h.router.mount_proc("/", |_req, res| {
        Box::pin(async move {
            res.set_chunked(true);
            res.set_body(Body::from_reader(futures_lite::io::Cursor::new(b"a\r\nb".to_vec()), None));
            Ok(())
        })
    });

    let out = h.exchange("GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;

    assert!(out.contains("\r\nTransfer-Encoding: chunked\r\n"));
    assert!(!out.contains("Content-Length"));
    assert!(out.ends_with("\r\n\r\n4\r\na\r\nb\r\n0\r\n\r\n"), "{:?}", out);
}

#[async_std::test]
async fn proc_bodies_without_length_close() {
    let h = Harness::new();
    h.router.mount_proc("/", |_req, res| {
        Box::pin(async move {
            res.set_body(Body::from_proc(|mut sink| {
                Box::pin(async move {
                    sink.write(b"streamed").await?;
                    Ok(())
                })
            }));
            Ok(())
        })
    });

    let out = h
        .exchange("GET / HTTP/1.1\r\nHost: a\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n")
        .await;

    assert!(out.contains("\r\nConnection: close\r\n"));
    assert!(out.ends_with("\r\n\r\nstreamed"));
    assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 1);
}

#[async_std::test]
async fn header_line_breaks_never_reach_the_wire() {
    let h = Harness::new();
    h.router.mount_proc("/", |_req, res| {
        Box::pin(async move {
            res.insert_header("x-evil", "a\r\nSet-Cookie: pwned=1");
            res.set_body("unreachable");
            Ok(())
        })
    });

    let out = h.exchange("GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;

    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{}", out);
    assert!(!out.contains("\r\nSet-Cookie: pwned=1"));
    assert!(!out.contains("unreachable"));
    assert!(h.log.contains("invalid value for response header `x-evil`"));
}

#[async_std::test]
async fn reason_phrase_line_breaks_never_reach_the_wire() {
    let h = Harness::new();
    h.router.mount_proc("/", |_req, res| {
        Box::pin(async move {
            res.set_reason_phrase("OK\r\nSet-Cookie: pwned=1");
            res.set_body("unreachable");
            Ok(())
        })
    });

    let out = h.exchange("GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;

    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{}", out);
    assert!(!out.contains("pwned"));
    assert!(!out.contains("unreachable"));
    assert!(h.log.contains("invalid response reason phrase"));
}

#[async_std::test]
async fn bodyless_statuses() {
    for status in &[102u16, 204, 304] {
        let h = Harness::new();
        let status = *status;
        h.router.mount_proc("/", move |_req, res| {
            Box::pin(async move {
                res.set_status(status);
                res.set_body("dropped");
                Ok(())
            })
        });

        let out = h.exchange("GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;

        assert!(out.starts_with(&format!("HTTP/1.1 {}", status)), "{}", out);
        assert!(!out.contains("Content-Length"), "{}", out);
        assert!(out.ends_with("\r\n\r\n"), "{}", out);
        assert!(!out.contains("dropped"));
    }
}

#[async_std::test]
async fn head_responses_carry_the_length_but_no_body() {
    let h = Harness::new();
    hello(&h, "/");

    let out = h.exchange("HEAD / HTTP/1.1\r\nHost: a\r\n\r\n").await;

    assert!(out.contains("\r\nContent-Length: 2\r\n"));
    assert!(out.ends_with("\r\n\r\n"));
}

#[async_std::test]
async fn options_asterisk() {
    let h = Harness::new();

    let out = h.exchange("OPTIONS * HTTP/1.1\r\nHost: a\r\n\r\n").await;

    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("\r\nAllow: GET,HEAD,POST,OPTIONS\r\n"));
    assert!(out.contains("\r\nContent-Length: 0\r\n"));
}

#[async_std::test]
async fn other_asterisk_requests_are_not_found() {
    let h = Harness::new();
    hello(&h, "/");

    let out = h.exchange("GET * HTTP/1.1\r\nHost: a\r\n\r\n").await;

    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[async_std::test]
async fn unmounted_paths_are_not_found() {
    let h = Harness::new();
    hello(&h, "/mounted");

    let out = h.exchange("GET /elsewhere HTTP/1.1\r\nHost: a\r\n\r\n").await;

    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(out.contains("\r\nContent-Type: text/html; charset=ISO-8859-1\r\n"));
    assert!(out.contains("\r\nConnection: close\r\n"));
    assert!(out.contains("`/elsewhere` not found."));
    assert!(out.contains("localhost:80") || out.contains("a:80"));
}

#[async_std::test]
async fn routing_sets_script_name_and_path_info() {
    let h = Harness::new();
    for prefix in &["/", "/foo", "/foo/bar", "/foo/bar/baz"] {
        let prefix = prefix.to_string();
        h.router.mount_proc(&prefix.clone(), move |req, res| {
            let prefix = prefix.clone();
            Box::pin(async move {
                res.set_body(format!("{}|{}|{}", prefix, req.script_name(), req.path_info()));
                Ok(())
            })
        });
    }

    let out = h
        .exchange(
            "GET /foo/bar/baz/x HTTP/1.1\r\nHost: a\r\n\r\n\
             GET /foo2 HTTP/1.1\r\nHost: a\r\n\r\n",
        )
        .await;

    let bodies: Vec<String> = split_responses(&out).into_iter().map(|(_, b)| b).collect();
    assert_eq!(bodies, vec!["/foo/bar/baz|/foo/bar/baz|/x", "/||/foo2"]);
}

#[async_std::test]
async fn handler_errors_become_error_pages() {
    let h = Harness::new();
    h.router.mount_proc("/", |_req, _res| {
        Box::pin(async move { Err(http_types::Error::from_str(StatusCode::Forbidden, "go away")) })
    });

    let out = h.exchange("GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;

    assert!(out.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(out.contains("go away"));
    assert!(h.log.contains("go away"));
}

#[async_std::test]
async fn redirects_are_absolute() {
    let h = Harness::new();
    h.router.mount_proc("/", |_req, res| {
        Box::pin(async move {
            res.set_redirect(StatusCode::Found, "/elsewhere?x=1");
            Ok(())
        })
    });

    let out = h.exchange("GET /here HTTP/1.1\r\nHost: example.com:8080\r\n\r\n").await;

    assert!(out.starts_with("HTTP/1.1 302 Found\r\n"));
    assert!(out.contains("\r\nLocation: http://example.com:8080/elsewhere?x=1\r\n"));
}

#[async_std::test]
async fn application_triples() {
    let h = Harness::new();
    h.router.mount_app("/app", |req| {
        Box::pin(async move {
            let mut headers = Headers::new();
            headers.append("set-cookie", "a=1");
            headers.append("set-cookie", "b=2");
            headers.append("x-multi", "1");
            headers.append("x-multi", "2");
            headers.append("content-type", "text/plain");
            Ok((201, headers, Body::from(req.path_info().to_owned())))
        })
    });

    let out = h.exchange("GET /app/thing HTTP/1.1\r\nHost: a\r\n\r\n").await;

    assert!(out.starts_with("HTTP/1.1 201 Created\r\n"));
    assert!(out.contains("\r\nSet-Cookie: a=1\r\n"));
    assert!(out.contains("\r\nSet-Cookie: b=2\r\n"));
    assert!(out.contains("\r\nX-Multi: 1, 2\r\n"));
    assert!(out.ends_with("\r\n\r\n/thing"));
}

#[async_std::test]
async fn upgrades_hand_over_the_connection() {
    let h = Harness::new();
    h.router.mount_proc("/", |_req, res| {
        Box::pin(async move {
            res.set_status(101u16);
            res.upgrade("echo", |mut conn| {
                Box::pin(async move {
                    let mut buf = Vec::new();
                    if conn.read_to_end(&mut buf).await.is_ok() {
                        let _ = conn.write_all(&buf).await;
                    }
                })
            });
            Ok(())
        })
    });

    let out = h
        .exchange("GET / HTTP/1.1\r\nHost: a\r\nUpgrade: echo\r\nConnection: upgrade\r\n\r\nping")
        .await;

    assert!(out.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{}", out);
    assert!(out.contains("\r\nUpgrade: echo\r\n"));
    assert!(out.contains("\r\nConnection: upgrade\r\n"));
    assert!(out.ends_with("\r\n\r\nping"));
}

#[async_std::test]
async fn access_log_records() {
    let h = Harness::with_config(
        async_h1d::ServerConfig::default()
            .with_access_log(vec![async_h1d::AccessLog::new("%m %U %s %b %{Host}i")]),
    );
    hello(&h, "/");

    h.exchange("GET /x?y HTTP/1.1\r\nHost: example.com\r\n\r\n").await;

    assert_eq!(h.access.lines(), vec!["GET /x 200 2 example.com".to_owned()]);
}
