use actix_web::cookie::Cookie;
use actix_web::{HttpRequest, HttpResponse};
use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};

use crate::auth::LoginForm;
use crate::config::*;
use crate::core::static_server::asset_text;
use crate::models::models::{avatar_url, PostView, User};
use crate::posts::PostForm;
use crate::users::{EditProfileForm, RegistrationForm};

const FALLBACK_LAYOUT: &str = "<!doctype html><html><head><title>PAGE_TITLE</title></head>\
    <body>PAGE_NAV PAGE_FLASHES PAGE_CONTENT</body></html>";

/// Prev/next links under a paginated list.
#[derive(Debug, Default)]
pub struct PageLinks {
    pub prev: Option<String>,
    pub next: Option<String>,
}

pub struct Profile<'a> {
    pub user: &'a User,
    pub followers: usize,
    pub following: usize,
    pub viewer_follows: bool,
}

fn layout() -> String {
    asset_text("layout.html").unwrap_or_else(|e| {
        tracing::error!(error = %e, "layout template missing, using fallback");
        FALLBACK_LAYOUT.to_string()
    })
}

/// Substitutes each placeholder once, left to right. Inserted values are never rescanned.
fn fill(template: &str, slots: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    loop {
        let next = slots
            .iter()
            .filter_map(|(key, value)| rest.find(key).map(|pos| (pos, *key, *value)))
            .min_by_key(|(pos, _, _)| *pos);

        match next {
            Some((pos, key, value)) => {
                out.push_str(&rest[..pos]);
                out.push_str(value);
                rest = &rest[pos + key.len()..];
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

fn nav(user: Option<&User>) -> String {
    let left = r#"<a href="/index">Microblog</a> <a href="/index">Home</a> <a href="/explore">Explore</a>"#;
    match user {
        Some(u) => format!(
            r#"<nav>{} <span class="right"><a href="/user/{}">Profile</a> <a href="/logout">Logout</a></span></nav>"#,
            left,
            attr(&urlencoding::encode(&u.username))
        ),
        None => format!(
            r#"<nav>{} <span class="right"><a href="/login">Login</a></span></nav>"#,
            left
        ),
    }
}

fn flashes_html(messages: &[String]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let items: String = messages
        .iter()
        .map(|m| format!("<li>{}</li>", text(m)))
        .collect();
    format!(r#"<ul class="flashes">{}</ul>"#, items)
}

fn take_flashes(req: &HttpRequest) -> Vec<String> {
    req.cookie(FLASH_COOKIE)
        .map(|c| {
            urlencoding::decode(c.value())
                .map(|v| v.into_owned())
                .unwrap_or_default()
        })
        .map(|v| v.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

fn document(title: &str, user: Option<&User>, flashes: &[String], content: &str) -> String {
    let title = format!("{} - Microblog", text(title));
    let nav = nav(user);
    let flashes = flashes_html(flashes);
    fill(
        &layout(),
        &[
            ("PAGE_TITLE", title.as_str()),
            ("PAGE_NAV", nav.as_str()),
            ("PAGE_FLASHES", flashes.as_str()),
            ("PAGE_CONTENT", content),
        ],
    )
}

/// Renders a full page and consumes any pending flash messages.
fn page(req: &HttpRequest, title: &str, user: Option<&User>, content: &str) -> HttpResponse {
    let flashes = take_flashes(req);
    let mut resp = HttpResponse::Ok();
    resp.content_type("text/html; charset=utf-8");
    if !flashes.is_empty() {
        let mut removal = Cookie::new(FLASH_COOKIE, "");
        removal.set_path("/");
        removal.make_removal();
        resp.cookie(removal);
    }
    resp.body(document(title, user, &flashes, content))
}

/// Redirects to `location`, showing `message` on the next rendered page.
pub fn flash_redirect(location: &str, message: &str) -> HttpResponse {
    let mut cookie = Cookie::new(FLASH_COOKIE, urlencoding::encode(message).into_owned());
    cookie.set_path("/");
    cookie.set_http_only(true);

    HttpResponse::Found()
        .insert_header(("Location", location))
        .cookie(cookie)
        .finish()
}

fn form_errors(errors: &[String]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let items: String = errors
        .iter()
        .map(|e| format!("<li>{}</li>", text(e)))
        .collect();
    format!(r#"<ul class="errors">{}</ul>"#, items)
}

fn pagination(links: &PageLinks) -> String {
    let prev = links
        .prev
        .as_ref()
        .map(|u| format!(r#"<a class="prev" href="{}">&larr; Newer posts</a>"#, attr(u)))
        .unwrap_or_default();
    let next = links
        .next
        .as_ref()
        .map(|u| format!(r#"<a class="next" href="{}">Older posts &rarr;</a>"#, attr(u)))
        .unwrap_or_default();
    format!(r#"<div class="pager">{}{}</div>"#, prev, next)
}

fn post_list(posts: &[PostView]) -> String {
    posts
        .iter()
        .map(|p| {
            format!(
                r#"<div class="post"><img src="{avatar}" alt=""><div><a href="/user/{link}">{name}</a> <span class="ts">{ts}</span><p>{body}</p></div></div>"#,
                avatar = attr(&avatar_url(&p.author_email, 36)),
                link = attr(&urlencoding::encode(&p.author_username)),
                name = text(&p.author_username),
                ts = p.post.timestamp.format("%Y-%m-%d %H:%M UTC"),
                body = text(&p.post.body),
            )
        })
        .collect()
}

pub fn render_index(
    req: &HttpRequest,
    user: &User,
    title: &str,
    form: Option<(&PostForm, &[String])>,
    posts: &[PostView],
    links: &PageLinks,
) -> HttpResponse {
    let greeting = format!("<h1>Hi, {}!</h1>", text(&user.username));
    let form_html = form
        .map(|(f, errors)| {
            format!(
                r#"<form method="post" action="/index">{errors}<label for="post">Say something</label><textarea id="post" name="post" maxlength="{max}">{value}</textarea><button type="submit">Submit</button></form>"#,
                errors = form_errors(errors),
                max = MAX_POST_LENGTH,
                value = text(&f.post),
            )
        })
        .unwrap_or_default();

    let content = format!("{}{}{}{}", greeting, form_html, post_list(posts), pagination(links));
    page(req, title, Some(user), &content)
}

pub fn render_profile(
    req: &HttpRequest,
    viewer: &User,
    profile: &Profile<'_>,
    posts: &[PostView],
    links: &PageLinks,
) -> HttpResponse {
    let user = profile.user;
    let encoded = urlencoding::encode(&user.username);

    let action = if user.id == viewer.id {
        r#"<a href="/edit_profile">Edit your profile</a>"#.to_string()
    } else if profile.viewer_follows {
        format!(r#"<a href="/unfollow/{}">Unfollow</a>"#, attr(&encoded))
    } else {
        format!(r#"<a href="/follow/{}">Follow</a>"#, attr(&encoded))
    };

    let about = user
        .about_me
        .as_ref()
        .map(|a| format!("<p>{}</p>", text(a)))
        .unwrap_or_default();

    let content = format!(
        r#"<div class="profile"><img src="{avatar}" alt=""><div><h1>User: {name}</h1>{about}<p>Last seen on: {seen}</p><p>{followers} followers, {following} following.</p><p>{action}</p></div></div>{posts}{pager}"#,
        avatar = attr(&user.avatar(128)),
        name = text(&user.username),
        about = about,
        seen = user.last_seen.format("%Y-%m-%d %H:%M UTC"),
        followers = profile.followers,
        following = profile.following,
        action = action,
        posts = post_list(posts),
        pager = pagination(links),
    );
    page(req, &user.username, Some(viewer), &content)
}

pub fn render_login(req: &HttpRequest, form: &LoginForm, errors: &[String]) -> HttpResponse {
    let content = format!(
        r#"<h1>Sign In</h1><form method="post">{errors}<label for="username">Username</label><input id="username" name="username" value="{username}"><label for="password">Password</label><input id="password" name="password" type="password"><label><input name="remember_me" type="checkbox"> Remember Me</label><button type="submit">Sign In</button></form><p>New User? <a href="/register">Click to Register!</a></p><p>Forgot Your Password? <a href="/reset_password_request">Click to Reset It</a></p>"#,
        errors = form_errors(errors),
        username = attr(&form.username),
    );
    page(req, "Sign In", None, &content)
}

pub fn render_register(req: &HttpRequest, form: &RegistrationForm, errors: &[String]) -> HttpResponse {
    let content = format!(
        r#"<h1>Register</h1><form method="post" action="/register">{errors}<label for="username">Username</label><input id="username" name="username" maxlength="{max}" value="{username}"><label for="email">Email</label><input id="email" name="email" type="email" value="{email}"><label for="password">Password</label><input id="password" name="password" type="password"><label for="password2">Repeat Password</label><input id="password2" name="password2" type="password"><button type="submit">Register</button></form>"#,
        errors = form_errors(errors),
        max = MAX_USERNAME_LENGTH,
        username = attr(&form.username),
        email = attr(&form.email),
    );
    page(req, "Register", None, &content)
}

pub fn render_edit_profile(
    req: &HttpRequest,
    user: &User,
    form: &EditProfileForm,
    errors: &[String],
) -> HttpResponse {
    let content = format!(
        r#"<h1>Edit Profile</h1><form method="post" action="/edit_profile">{errors}<label for="username">Username</label><input id="username" name="username" maxlength="{max_name}" value="{username}"><label for="about_me">About me</label><textarea id="about_me" name="about_me" maxlength="{max_about}">{about}</textarea><button type="submit">Submit</button></form>"#,
        errors = form_errors(errors),
        max_name = MAX_USERNAME_LENGTH,
        username = attr(&form.username),
        max_about = MAX_ABOUT_ME_LENGTH,
        about = text(&form.about_me),
    );
    page(req, "Edit Profile", Some(user), &content)
}

pub fn render_reset_request(req: &HttpRequest, errors: &[String]) -> HttpResponse {
    let content = format!(
        r#"<h1>Reset Password</h1><form method="post" action="/reset_password_request">{}<label for="email">Email</label><input id="email" name="email" type="email"><button type="submit">Request Password Reset</button></form>"#,
        form_errors(errors)
    );
    page(req, "Reset Password", None, &content)
}

pub fn render_reset_password(req: &HttpRequest, errors: &[String]) -> HttpResponse {
    let content = format!(
        r#"<h1>Reset Your Password</h1><form method="post">{}<label for="password">Password</label><input id="password" name="password" type="password"><label for="password2">Repeat Password</label><input id="password2" name="password2" type="password"><button type="submit">Request Password Reset</button></form>"#,
        form_errors(errors)
    );
    page(req, "Reset Password", None, &content)
}

pub fn render_not_found() -> String {
    document(
        "Not Found",
        None,
        &[],
        r#"<h1>File Not Found</h1><p><a href="/index">Back</a></p>"#,
    )
}

pub fn render_server_error() -> String {
    document(
        "Error",
        None,
        &[],
        r#"<h1>An unexpected error has occurred</h1><p>The administrator has been notified. Sorry for the inconvenience!</p><p><a href="/index">Back</a></p>"#,
    )
}

pub fn render_error(status: u16, message: &str) -> String {
    let content = format!(
        r#"<h1>{}</h1><p>{}</p><p><a href="/index">Back</a></p>"#,
        status,
        text(message)
    );
    document("Error", None, &[], &content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use chrono::Utc;

    fn user(name: &str) -> User {
        User {
            id: 7,
            username: name.to_string(),
            email: format!("{}@example.com", name),
            password_hash: String::new(),
            about_me: Some("<script>alert(1)</script>".to_string()),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn fill_does_not_rescan_values() {
        let out = fill("A B", &[("A", "B"), ("B", "x")]);
        assert_eq!(out, "B x");
    }

    #[test]
    fn profile_escapes_user_content() {
        let req = TestRequest::default().to_http_request();
        let susan = user("PAGE_NAV<i>");
        let profile = Profile {
            user: &susan,
            followers: 2,
            following: 1,
            viewer_follows: false,
        };
        let viewer = user("viewer");
        let resp = render_profile(&req, &viewer, &profile, &[], &PageLinks::default());
        assert_eq!(resp.status(), 200);

        let html = document(&susan.username, None, &[], "");
        assert!(html.contains("PAGE_NAV&lt;i&gt;"));
    }

    #[test]
    fn flash_redirect_sets_cookie() {
        let resp = flash_redirect("/index", "Your post is now live!");
        assert_eq!(resp.status(), 302);
        let cookie = resp.cookies().find(|c| c.name() == FLASH_COOKIE).unwrap();
        assert_eq!(
            urlencoding::decode(cookie.value()).unwrap(),
            "Your post is now live!"
        );
    }

    #[test]
    fn flashes_are_read_and_cleared() {
        let req = TestRequest::default()
            .cookie(Cookie::new(FLASH_COOKIE, urlencoding::encode("hello").into_owned()))
            .to_http_request();
        assert_eq!(take_flashes(&req), vec!["hello".to_string()]);

        let resp = render_reset_request(&req, &[]);
        let cleared = resp.cookies().find(|c| c.name() == FLASH_COOKIE).unwrap();
        assert_eq!(cleared.value(), "");
    }

    #[test]
    fn pagination_links_only_when_present() {
        let none = pagination(&PageLinks::default());
        assert!(!none.contains("href"));
        let both = pagination(&PageLinks {
            prev: Some("/index?page=1".into()),
            next: Some("/index?page=3".into()),
        });
        assert!(both.contains("/index?page=1"));
        assert!(both.contains("/index?page=3"));
    }
}
