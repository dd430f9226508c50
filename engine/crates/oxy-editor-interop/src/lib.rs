//! 编辑器通过 C ABI 调用的接口
//!
//! 这里只做参数转换，具体逻辑在各个 crate 中。

use std::ffi::{CStr, c_char};

use oxy_crate_tools::init_log::{LogConfig, init_log_with};

/// 把 C 字符串转换为 &str；空指针或者非 UTF-8 返回 None
///
/// # Safety
/// `ptr` 为空，或者指向一个以 0 结尾、在调用期间有效的字符串
unsafe fn str_from_ptr<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// 创建场景
///
/// 引擎目前只有一个 RenderWorld，场景的创建由宿主在 attach 时完成，这里始终返回 false。
///
/// # Safety
/// `name` 为空，或者指向一个以 0 结尾的字符串
#[unsafe(no_mangle)]
pub unsafe extern "C" fn oxy_create_scene(name: *const c_char) -> bool {
    let Some(name) = (unsafe { str_from_ptr(name) }) else {
        log::error!("oxy_create_scene: invalid scene name");
        return false;
    };
    log::warn!("oxy_create_scene(\"{}\") is not supported", name);
    false
}

/// 删除场景，与 [`oxy_create_scene`] 相同，始终返回 false
///
/// # Safety
/// `name` 为空，或者指向一个以 0 结尾的字符串
#[unsafe(no_mangle)]
pub unsafe extern "C" fn oxy_remove_scene(name: *const c_char) -> bool {
    let Some(name) = (unsafe { str_from_ptr(name) }) else {
        log::error!("oxy_remove_scene: invalid scene name");
        return false;
    };
    log::warn!("oxy_remove_scene(\"{}\") is not supported", name);
    false
}

/// 配置日志
///
/// - `verbosity`: [-9, 9]，超出范围会被 clamp
/// - `vmodule`: `"pattern=level,..."`，可以为空指针
///
/// vmodule 无法解析时返回 false，日志配置不变。
///
/// # Safety
/// `vmodule` 为空，或者指向一个以 0 结尾的字符串
#[unsafe(no_mangle)]
pub unsafe extern "C" fn oxy_configure_logging(verbosity: i32, colored: bool, vmodule: *const c_char) -> bool {
    let config = LogConfig::new(verbosity, colored);
    let config = if vmodule.is_null() {
        config
    } else {
        let Some(patterns) = (unsafe { str_from_ptr(vmodule) }) else {
            log::error!("oxy_configure_logging: vmodule is not valid UTF-8");
            return false;
        };
        match config.with_vmodule(patterns) {
            Ok(config) => config,
            Err(entry) => {
                log::error!("oxy_configure_logging: invalid vmodule entry \"{}\"", entry);
                return false;
            }
        }
    };

    let result = init_log_with(&config);
    log::debug!("logging configured: {:?}", result);
    true
}
