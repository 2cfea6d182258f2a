//! Built-in disguise profiles
//!
//! Header values may use `{host}`, `{timestamp}` and `{request_id}`
//! placeholders, see [`super::render`].

use super::DisguiseProfile;
use crate::transport::BrowserProfile;

/// Every disguise shipped with the client, in declaration order
pub const BUILTIN_PROFILES: &[DisguiseProfile] = &[
    DisguiseProfile {
        id: "https",
        display_name: "HTTPS",
        priority: 100,
        request_path: "/tunnel",
        tls_profile: BrowserProfile::Chrome,
        headers: &[
            (
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            ),
            ("Accept", "*/*"),
            ("Accept-Language", "en-US,en;q=0.9"),
            ("Content-Type", "application/octet-stream"),
        ],
    },
    DisguiseProfile {
        id: "teams",
        display_name: "Microsoft Teams",
        priority: 90,
        request_path: "/teams/messages",
        tls_profile: BrowserProfile::Edge,
        headers: &[
            (
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Teams/1.5.00.32283 Chrome/120.0.0.0 Safari/537.36",
            ),
            ("Content-Type", "application/json"),
            ("X-Ms-Client-Version", "27/1.0.0.2024"),
            ("X-Ms-Session-Id", "session-{timestamp}"),
            ("X-Ms-Request-Id", "{request_id}"),
        ],
    },
    DisguiseProfile {
        id: "google",
        display_name: "Google Workspace",
        priority: 85,
        request_path: "/google/drive/files",
        tls_profile: BrowserProfile::Chrome,
        headers: &[
            (
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            ),
            ("Content-Type", "application/json"),
            ("X-Goog-Api-Client", "gl-go/1.20.0 gdcl/0.110.0"),
            ("X-Goog-Request-Id", "req-{request_id}"),
        ],
    },
    DisguiseProfile {
        id: "zoom",
        display_name: "Zoom",
        priority: 80,
        request_path: "/zoom/",
        tls_profile: BrowserProfile::Chrome,
        headers: &[
            (
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Zoom/5.16.0 Chrome/120.0.0.0 Safari/537.36",
            ),
            ("Content-Type", "application/octet-stream"),
            ("X-Zm-Client-Ver", "5.16.0"),
            ("X-Zm-Trackingid", "{request_id}"),
        ],
    },
    DisguiseProfile {
        id: "facetime",
        display_name: "FaceTime",
        priority: 75,
        request_path: "/facetime/",
        tls_profile: BrowserProfile::IosSafari,
        headers: &[
            ("User-Agent", "FaceTime/1.0 CFNetwork/1404.0.5 Darwin/22.3.0"),
            ("Content-Type", "application/x-apple-plist"),
            ("X-Apple-Request-UUID", "{request_id}"),
        ],
    },
    DisguiseProfile {
        id: "doh",
        display_name: "DNS over HTTPS",
        priority: 70,
        request_path: "/dns-query",
        tls_profile: BrowserProfile::Firefox,
        headers: &[
            (
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
            ),
            ("Accept", "application/dns-message"),
            ("Content-Type", "application/dns-message"),
        ],
    },
    DisguiseProfile {
        id: "shaparak",
        display_name: "Shaparak Banking",
        priority: 60,
        request_path: "/shaparak/transaction",
        tls_profile: BrowserProfile::AndroidChrome,
        headers: &[
            ("User-Agent", "ShaparakClient/2.0"),
            ("Content-Type", "text/xml; charset=utf-8"),
            ("SOAPAction", "ProcessTransaction"),
        ],
    },
    DisguiseProfile {
        id: "vk",
        display_name: "VK",
        priority: 50,
        request_path: "/vk/",
        tls_profile: BrowserProfile::AndroidChrome,
        headers: &[
            ("User-Agent", "VKAndroidApp/7.26-13672 (Android 14; SDK 34; arm64-v8a; ru)"),
            ("Content-Type", "application/x-www-form-urlencoded"),
            ("X-VK-Android-Client", "new"),
        ],
    },
    DisguiseProfile {
        id: "yandex",
        display_name: "Yandex",
        priority: 45,
        request_path: "/yandex/",
        tls_profile: BrowserProfile::Chrome,
        headers: &[
            (
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 YaBrowser/23.11.0 Safari/537.36",
            ),
            ("Content-Type", "application/json"),
            ("X-Request-Id", "{request_id}"),
        ],
    },
    DisguiseProfile {
        id: "wechat",
        display_name: "WeChat",
        priority: 40,
        request_path: "/wechat/",
        tls_profile: BrowserProfile::AndroidChrome,
        headers: &[
            (
                "User-Agent",
                "Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36 MicroMessenger/8.0.37",
            ),
            ("Content-Type", "application/octet-stream"),
            ("X-WECHAT-KEY", "{request_id}"),
        ],
    },
];
